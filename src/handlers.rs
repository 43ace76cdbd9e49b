use crate::AppState;
use crate::error::TrackingError;
use crate::events::MissionEvent;
use crate::ingestion::IngestionPath;
use crate::metrics;
use crate::models::{
    self, BackgroundBatch, CompleteRequest, DeliveryMode, DeliveryResponse, DeviceStatus,
    ErrorResponse, MissionId, PermissionsRequest, PublicView, PublishResponse, RawSample,
    SessionId, StartRequest, StatsResponse,
};
use crate::live::ViewerGuard;
use crate::source::BACKGROUND_TASK_NAME;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, Responder, ResponseError, get, post, web};
use log::info;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

impl ResponseError for TrackingError {
    fn status_code(&self) -> StatusCode {
        match self {
            TrackingError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            TrackingError::AlreadyActive { .. }
            | TrackingError::NotPaused { .. }
            | TrackingError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TrackingError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackingError::InvalidSample(_) => StatusCode::BAD_REQUEST,
            TrackingError::IngestionWriteFailed(_)
            | TrackingError::AggregationReadFailed(_)
            | TrackingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

/// The device reports what the driver granted.
#[post("/api/device/permissions")]
pub async fn set_permissions(
    data: web::Json<PermissionsRequest>,
    app_state: web::Data<AppState>,
) -> impl Responder {
    app_state.device.set_permissions(data.into_inner());
    HttpResponse::NoContent().finish()
}

#[get("/api/device/status")]
pub async fn device_status(app_state: web::Data<AppState>) -> impl Responder {
    let delivery = app_state
        .manager
        .ingestion_path()
        .await
        .map(|path| match path {
            IngestionPath::Foreground { .. } => DeliveryMode::Foreground,
            IngestionPath::Background { .. } => DeliveryMode::Background,
        });
    web::Json(DeviceStatus {
        current_session: app_state.manager.current_session(),
        delivery,
        notification: app_state.device.notification(),
    })
}

/// A sample from the foreground position watch.
#[post("/api/device/sample")]
pub async fn post_sample(
    data: web::Json<RawSample>,
    app_state: web::Data<AppState>,
) -> impl Responder {
    let delivered = app_state.device.push_sample(data.into_inner()).await;
    web::Json(DeliveryResponse { delivered })
}

/// A batch handed to the background task while the app is suspended.
#[post("/api/device/background")]
pub async fn post_background_batch(
    data: web::Json<BackgroundBatch>,
    app_state: web::Data<AppState>,
) -> impl Responder {
    let delivered = app_state
        .device
        .push_background_batch(BACKGROUND_TASK_NAME, data.into_inner().locations)
        .await;
    web::Json(DeliveryResponse { delivered })
}

#[post("/api/sessions")]
pub async fn start_session(
    data: web::Json<StartRequest>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let StartRequest {
        mission_id,
        driver_id,
        departure_inspection_id,
        start_location,
    } = data.into_inner();
    let session = app_state
        .manager
        .start_session(&mission_id, &driver_id, departure_inspection_id, start_location)
        .await?;
    Ok(HttpResponse::Created().json(session))
}

#[post("/api/sessions/{id}/pause")]
pub async fn pause_session(
    path: web::Path<SessionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(app_state.manager.pause_session(&path).await?))
}

#[post("/api/sessions/{id}/resume")]
pub async fn resume_session(
    path: web::Path<SessionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(app_state.manager.resume_session(&path).await?))
}

/// The body is optional; an empty request completes without arrival details.
#[post("/api/sessions/{id}/complete")]
pub async fn complete_session(
    path: web::Path<SessionId>,
    data: Option<web::Json<CompleteRequest>>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let CompleteRequest {
        arrival_inspection_id,
        end_location,
    } = data.map(web::Json::into_inner).unwrap_or_default();
    let session = app_state
        .manager
        .complete_session(&path, arrival_inspection_id, end_location)
        .await?;
    Ok(web::Json(session))
}

#[post("/api/sessions/{id}/cancel")]
pub async fn cancel_session(
    path: web::Path<SessionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(app_state.manager.cancel_session(&path).await?))
}

#[get("/api/sessions/{id}")]
pub async fn get_session(
    path: web::Path<SessionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(app_state.manager.get_session(&path).await?))
}

#[get("/api/sessions/{id}/points")]
pub async fn get_points(
    path: web::Path<SessionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(app_state.manager.points(&path).await?))
}

#[post("/api/sessions/{id}/recompute")]
pub async fn recompute_stats(
    path: web::Path<SessionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let stats = app_state.manager.recompute_stats(&path).await?;
    Ok(web::Json(StatsResponse { stats }))
}

/// `null` when the mission has no active session.
#[get("/api/missions/{id}/active")]
pub async fn get_active_session(
    path: web::Path<MissionId>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(app_state.manager.get_active_session(&path).await?))
}

/// Publishes a mission milestone on the realtime bus.
#[post("/api/events")]
pub async fn publish_event(
    data: web::Json<MissionEvent>,
    app_state: web::Data<AppState>,
) -> impl Responder {
    let event = data.into_inner();
    info!("Milestone {} for mission {}", event.key(), event.mission_id());
    let subscribers = app_state.events.publish(event);
    web::Json(PublishResponse { subscribers })
}

#[get("/api/public/{token}")]
pub async fn public_view(
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let Some(session) = app_state.manager.find_by_public_token(&path).await? else {
        return Err(actix_web::error::ErrorNotFound("Unknown tracking link."));
    };
    let last_point = app_state.manager.points(&session.id).await?.pop();
    Ok(web::Json(PublicView {
        mission_id: session.mission_id,
        status: session.status,
        started_at: session.started_at,
        completed_at: session.completed_at,
        stats: session.stats,
        last_point,
    }))
}

#[get("/api/stream")]
pub async fn stream(
    data: web::Query<models::StreamRequest>,
    app_state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let missions: HashSet<MissionId> = data.missions.0.iter().cloned().collect();
    info!("Live viewer joined for missions [{}]", data.missions);

    let guard = ViewerGuard::new(app_state.open_streams.clone());
    let updates = app_state.live.updates(missions);
    let events = futures_util::StreamExt::map(
        updates,
        move |update| -> anyhow::Result<actix_web_lab::sse::Event> {
            let _open = &guard;
            let json_data = serde_json::to_string(&update)?;
            Ok(actix_web_lab::sse::Event::Data(
                actix_web_lab::sse::Data::new(json_data),
            ))
        },
    );

    Ok(actix_web_lab::sse::Sse::from_stream(events).with_keep_alive(app_state.keep_alive))
}

#[get("/metrics")]
pub async fn get_metrics(app_state: web::Data<AppState>) -> impl Responder {
    let body = metrics::generate_metrics(
        &app_state.counters,
        app_state.open_streams.load(Ordering::SeqCst),
        &app_state.started,
    );
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}
