//! Tracking session lifecycle.
//!
//! ```text
//! (none) -> active -> { paused <-> active } -> { completed, cancelled }
//! ```
//!
//! Every transition also decides which ingestion path is registered, so the
//! manager is the only place that starts or stops sample delivery.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::aggregation::Aggregator;
use crate::background::{BackgroundContinuation, CurrentSession};
use crate::error::{Permission, Result, TrackingError};
use crate::ingestion::{Ingestion, IngestionControl, IngestionPath};
use crate::live::LiveFeed;
use crate::metrics::SampleCounters;
use crate::models::{
    DriverId, InspectionId, LocationPoint, MissionId, Place, RouteStats, SessionId, SessionPatch,
    SessionStatus, TrackingSession, TrackingSessionBuilder,
};
use crate::queue::OperationQueue;
use crate::source::{LocationSource, Notification, SamplingPolicy};
use crate::store::TrackingStore;
use crate::utils;

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub sampling: SamplingPolicy,
    pub notification: Notification,
}

pub struct SessionManager {
    store: Arc<dyn TrackingStore>,
    source: Arc<dyn LocationSource>,
    control: IngestionControl,
    aggregator: Aggregator,
    current: CurrentSession,
    missions: OperationQueue<MissionId>,
    sessions: Arc<OperationQueue<SessionId>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        source: Arc<dyn LocationSource>,
        live: LiveFeed,
        counters: Arc<SampleCounters>,
        settings: TrackingSettings,
    ) -> Self {
        let sessions = Arc::new(OperationQueue::new());
        let current = CurrentSession::new();
        let ingestion = Ingestion::new(store.clone(), sessions.clone(), live, counters);
        let background = BackgroundContinuation::new(current.reader(), ingestion.clone());
        let control = IngestionControl::new(
            source.clone(),
            ingestion,
            background,
            settings.sampling,
            settings.notification,
        );
        Self {
            aggregator: Aggregator::new(store.clone()),
            store,
            source,
            control,
            current,
            missions: OperationQueue::new(),
            sessions,
        }
    }

    pub fn ingestion(&self) -> &Ingestion {
        self.control.ingestion()
    }

    /// The session the background task would currently record into.
    pub fn current_session(&self) -> Option<SessionId> {
        self.current.get()
    }

    pub async fn ingestion_path(&self) -> Option<IngestionPath> {
        self.control.current_path().await
    }

    async fn background_allowed(&self) -> bool {
        if !self.source.supports_background() {
            return false;
        }
        match self.source.request_background_permission().await {
            Ok(status) if status.is_granted() => true,
            Ok(_) => {
                warn!(
                    "Background location not granted, tracking stops when the app is suspended"
                );
                false
            }
            Err(err) => {
                warn!("Background permission request failed: {err:#}");
                false
            }
        }
    }

    async fn load(&self, session_id: &SessionId) -> Result<TrackingSession> {
        self.store
            .get_session(session_id)
            .await
            .map_err(TrackingError::Store)?
            .ok_or_else(|| TrackingError::NotFound(session_id.clone()))
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<TrackingSession> {
        self.load(session_id).await
    }

    /// The most recently started active session of the mission.
    pub async fn get_active_session(
        &self,
        mission_id: &MissionId,
    ) -> Result<Option<TrackingSession>> {
        Ok(self
            .store
            .sessions_for_mission(mission_id)
            .await
            .map_err(TrackingError::Store)?
            .into_iter()
            .find(|s| s.status == SessionStatus::Active))
    }

    /// The most recently started session that is active or paused.
    pub async fn get_open_session(
        &self,
        mission_id: &MissionId,
    ) -> Result<Option<TrackingSession>> {
        Ok(self
            .store
            .sessions_for_mission(mission_id)
            .await
            .map_err(TrackingError::Store)?
            .into_iter()
            .find(|s| !s.status.is_terminal()))
    }

    #[tracing::instrument(skip(self, start_location))]
    pub async fn start_session(
        &self,
        mission_id: &MissionId,
        driver_id: &DriverId,
        departure_inspection_id: Option<InspectionId>,
        start_location: Option<Place>,
    ) -> Result<TrackingSession> {
        let _turn = self.missions.enter(mission_id).await;

        let foreground = match self.source.request_foreground_permission().await {
            Ok(status) => status.is_granted(),
            Err(err) => {
                warn!("Foreground permission request failed: {err:#}");
                false
            }
        };
        if !foreground {
            return Err(TrackingError::PermissionDenied(Permission::Foreground));
        }
        let background_allowed = self.background_allowed().await;

        if let Some(active) = self.get_active_session(mission_id).await? {
            return Err(TrackingError::AlreadyActive {
                mission_id: mission_id.clone(),
                session_id: active.id,
            });
        }

        let mut session = TrackingSessionBuilder::new()
            .with_id(SessionId(utils::generate_id()))
            .with_mission_id(mission_id.clone())
            .with_driver_id(driver_id.clone())
            .with_status(SessionStatus::Active)
            .with_started_at(Utc::now())
            .build();
        session.public_token = Some(utils::generate_id());
        session.departure_inspection_id = departure_inspection_id;
        session.start_location = start_location;

        self.store
            .insert_session(&session)
            .await
            .map_err(TrackingError::Store)?;

        self.current.set(&session.id);
        self.control.activate(&session.id, background_allowed).await;

        info!("Started session {} for mission {mission_id}", session.id);
        Ok(session)
    }

    #[tracing::instrument(skip(self))]
    pub async fn pause_session(&self, session_id: &SessionId) -> Result<TrackingSession> {
        let _turn = self.sessions.enter(session_id).await;
        let session = self.load(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(TrackingError::InvalidTransition {
                session_id: session_id.clone(),
                from: session.status,
                to: SessionStatus::Paused,
            });
        }

        self.control.deactivate(session_id).await;
        self.current.clear(session_id);
        self.update(session, SessionPatch::status(SessionStatus::Paused))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn resume_session(&self, session_id: &SessionId) -> Result<TrackingSession> {
        let mission_id = self.load(session_id).await?.mission_id;
        let _mission_turn = self.missions.enter(&mission_id).await;
        let _turn = self.sessions.enter(session_id).await;

        let session = self.load(session_id).await?;
        match session.status {
            SessionStatus::Paused => {}
            SessionStatus::Active => {
                return Err(TrackingError::NotPaused {
                    session_id: session_id.clone(),
                    status: session.status,
                });
            }
            status => {
                return Err(TrackingError::InvalidTransition {
                    session_id: session_id.clone(),
                    from: status,
                    to: SessionStatus::Active,
                });
            }
        }
        if let Some(active) = self.get_active_session(&mission_id).await? {
            return Err(TrackingError::AlreadyActive {
                mission_id,
                session_id: active.id,
            });
        }

        let session = self
            .update(session, SessionPatch::status(SessionStatus::Active))
            .await?;
        let background_allowed = self.background_allowed().await;
        self.current.set(session_id);
        self.control.activate(session_id, background_allowed).await;
        Ok(session)
    }

    #[tracing::instrument(skip(self, end_location))]
    pub async fn complete_session(
        &self,
        session_id: &SessionId,
        arrival_inspection_id: Option<InspectionId>,
        end_location: Option<Place>,
    ) -> Result<TrackingSession> {
        let patch = SessionPatch {
            status: Some(SessionStatus::Completed),
            completed_at: Some(Utc::now()),
            end_location,
            arrival_inspection_id,
            stats: None,
        };
        self.finish(session_id, patch).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_session(&self, session_id: &SessionId) -> Result<TrackingSession> {
        let patch = SessionPatch {
            status: Some(SessionStatus::Cancelled),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        self.finish(session_id, patch).await
    }

    async fn finish(&self, session_id: &SessionId, patch: SessionPatch) -> Result<TrackingSession> {
        let _turn = self.sessions.enter(session_id).await;
        let session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Err(TrackingError::InvalidTransition {
                session_id: session_id.clone(),
                from: session.status,
                to: patch.status.unwrap_or(session.status),
            });
        }

        self.control.deactivate(session_id).await;
        self.current.clear(session_id);
        let mut session = self.update(session, patch).await?;

        match self.aggregator.recompute_stats(session_id).await {
            Ok(Some(stats)) => session.stats = Some(stats),
            Ok(None) => {}
            Err(err) => warn!("Final stats of session {session_id} not refreshed: {err}"),
        }
        info!("Session {session_id} is {}", session.status);
        Ok(session)
    }

    async fn update(
        &self,
        mut session: TrackingSession,
        patch: SessionPatch,
    ) -> Result<TrackingSession> {
        self.store
            .update_session(&session.id, &patch)
            .await
            .map_err(TrackingError::Store)?;
        patch.apply(&mut session);
        Ok(session)
    }

    pub async fn recompute_stats(&self, session_id: &SessionId) -> Result<Option<RouteStats>> {
        self.load(session_id).await?;
        self.ingestion().recompute_stats(session_id).await
    }

    pub async fn points(&self, session_id: &SessionId) -> Result<Vec<LocationPoint>> {
        self.load(session_id).await?;
        self.store
            .points_for_session(session_id)
            .await
            .map_err(TrackingError::AggregationReadFailed)
    }

    pub async fn find_by_public_token(&self, token: &str) -> Result<Option<TrackingSession>> {
        self.store
            .find_by_public_token(token)
            .await
            .map_err(TrackingError::Store)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::DeviceBridge;
    use crate::ingestion::SampleOutcome;
    use crate::models::{PermissionsRequest, RawSample};
    use crate::source::BACKGROUND_TASK_NAME;
    use crate::store::MemoryStore;
    use std::time::Duration;

    pub(crate) struct Harness {
        pub store: Arc<MemoryStore>,
        pub device: Arc<DeviceBridge>,
        pub manager: Arc<SessionManager>,
    }

    pub(crate) fn harness(mobile: bool, foreground: bool, background: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let device = Arc::new(DeviceBridge::new(mobile));
        device.set_permissions(PermissionsRequest {
            foreground,
            background,
        });
        let settings = TrackingSettings {
            sampling: SamplingPolicy::new(Duration::from_secs(2), 10.0),
            notification: Notification {
                title: "GPS tracking".to_string(),
                body: "Your position is shared for this mission".to_string(),
            },
        };
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            device.clone(),
            LiveFeed::new(16, 50.0, 200.0),
            Arc::new(SampleCounters::default()),
            settings,
        ));
        Harness {
            store,
            device,
            manager,
        }
    }

    pub(crate) fn sample(lat: f64, lon: f64, millis: i64, speed: Option<f64>) -> RawSample {
        RawSample {
            latitude: lat,
            longitude: lon,
            altitude: None,
            accuracy: Some(5.0),
            speed,
            heading: None,
            timestamp: (1_750_000_000_000 + millis) as f64,
        }
    }

    fn mission() -> MissionId {
        MissionId::from("mission-1")
    }

    fn driver() -> DriverId {
        DriverId::from("driver-1")
    }

    async fn active_count(h: &Harness, mission_id: &MissionId) -> usize {
        h.store
            .sessions_for_mission(mission_id)
            .await
            .unwrap()
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    #[tokio::test]
    async fn test_start_requires_foreground_permission() {
        let h = harness(true, false, false);
        let err = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::PermissionDenied(Permission::Foreground)));
        assert!(h.store.sessions_for_mission(&mission()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_background_uses_foreground_watch() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), Some(InspectionId::from("insp-1")), None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.departure_inspection_id, Some(InspectionId::from("insp-1")));
        assert!(session.public_token.is_some());
        assert_eq!(h.device.watch_count(), 1);
        assert!(!h.device.is_delivering(BACKGROUND_TASK_NAME));
        assert_eq!(h.manager.current_session(), Some(session.id.clone()));
    }

    #[tokio::test]
    async fn test_start_with_background_uses_single_path_and_notification() {
        let h = harness(true, true, true);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        assert_eq!(h.device.watch_count(), 0);
        assert!(h.device.is_delivering(BACKGROUND_TASK_NAME));
        assert_eq!(h.device.notification().unwrap().title, "GPS tracking");

        assert!(
            h.device
                .push_background_batch(BACKGROUND_TASK_NAME, vec![sample(48.85, 2.35, 0, None)])
                .await
        );
        let points = h.store.points_for_session(&session.id).await.unwrap();
        assert_eq!(points.len(), 1);
    }

    #[tokio::test]
    async fn test_desktop_never_asks_for_background() {
        let h = harness(false, true, true);
        h.manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        assert_eq!(h.device.watch_count(), 1);
        assert_eq!(h.device.registered_task_count(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_already_active() {
        let h = harness(true, true, false);
        let first = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        let err = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap_err();
        match err {
            TrackingError::AlreadyActive { session_id, .. } => assert_eq!(session_id, first.id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(active_count(&h, &mission()).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_one_active() {
        let h = harness(true, true, false);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = h.manager.clone();
            tasks.push(tokio::spawn(async move {
                let (mission_id, driver_id) = (mission(), driver());
                manager
                    .start_session(&mission_id, &driver_id, None, None)
                    .await
            }));
        }
        let mut started = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => started += 1,
                Err(TrackingError::AlreadyActive { .. }) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(active_count(&h, &mission()).await, 1);
        assert_eq!(h.store.sessions_for_mission(&mission()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();

        let paused = h.manager.pause_session(&session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(h.device.watch_count(), 0);
        assert_eq!(h.manager.current_session(), None);
        assert!(h.manager.get_active_session(&mission()).await.unwrap().is_none());

        assert!(matches!(
            h.manager.pause_session(&session.id).await,
            Err(TrackingError::InvalidTransition { .. })
        ));

        let resumed = h.manager.resume_session(&session.id).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        assert_eq!(h.device.watch_count(), 1);
        assert_eq!(h.manager.current_session(), Some(session.id.clone()));

        assert!(matches!(
            h.manager.resume_session(&session.id).await,
            Err(TrackingError::NotPaused { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let h = harness(true, true, false);
        let ghost = SessionId::from("ghost");
        assert!(matches!(h.manager.pause_session(&ghost).await, Err(TrackingError::NotFound(_))));
        assert!(matches!(h.manager.resume_session(&ghost).await, Err(TrackingError::NotFound(_))));
        assert!(matches!(
            h.manager.complete_session(&ghost, None, None).await,
            Err(TrackingError::NotFound(_))
        ));
        assert!(matches!(h.manager.cancel_session(&ghost).await, Err(TrackingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_terminal_sessions_accept_no_transition() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        let end = Place {
            latitude: 45.764,
            longitude: 4.8357,
            address: Some("Lyon".to_string()),
        };
        let done = h
            .manager
            .complete_session(&session.id, Some(InspectionId::from("arrival")), Some(end.clone()))
            .await
            .unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.end_location, Some(end));
        assert_eq!(done.arrival_inspection_id, Some(InspectionId::from("arrival")));
        assert_eq!(h.device.watch_count(), 0);

        for result in [
            h.manager.pause_session(&session.id).await,
            h.manager.resume_session(&session.id).await,
            h.manager.complete_session(&session.id, None, None).await,
            h.manager.cancel_session(&session.id).await,
        ] {
            assert!(matches!(result, Err(TrackingError::InvalidTransition { .. })));
        }
        let stored = h.store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_from_paused() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        h.manager.pause_session(&session.id).await.unwrap();
        let cancelled = h.manager.cancel_session(&session.id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_resume_refused_while_another_session_is_active() {
        let h = harness(true, true, false);
        let first = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        h.manager.pause_session(&first.id).await.unwrap();
        let second = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();

        let err = h.manager.resume_session(&first.id).await.unwrap_err();
        match err {
            TrackingError::AlreadyActive { session_id, .. } => assert_eq!(session_id, second.id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(active_count(&h, &mission()).await, 1);
    }

    #[tokio::test]
    async fn test_start_on_other_mission_takes_over_delivery() {
        let h = harness(true, true, false);
        let first = h
            .manager
            .start_session(&MissionId::from("m1"), &driver(), None, None)
            .await
            .unwrap();
        let second = h
            .manager
            .start_session(&MissionId::from("m2"), &driver(), None, None)
            .await
            .unwrap();

        assert_eq!(h.device.watch_count(), 1);
        let path = h.manager.ingestion_path().await.unwrap();
        assert_eq!(path.session_id(), &second.id);
        assert_eq!(h.manager.current_session(), Some(second.id.clone()));
        // the first session is left active, only its delivery stops
        let first = h.manager.get_session(&first.id).await.unwrap();
        assert_eq!(first.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_late_sample_after_pause_is_ignored() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        assert!(h.device.push_sample(sample(48.8566, 2.3522, 0, Some(0.0))).await);
        assert!(h.device.push_sample(sample(48.8606, 2.3376, 300_000, Some(5.0))).await);
        let before = h.manager.recompute_stats(&session.id).await.unwrap();
        assert!(before.is_some());

        h.manager.pause_session(&session.id).await.unwrap();

        // the watch is gone, so the device has nowhere to deliver
        assert!(!h.device.push_sample(sample(48.87, 2.30, 400_000, Some(30.0))).await);
        // a sample that was already in flight is rejected by the pipeline
        let outcome = h
            .manager
            .ingestion()
            .on_sample(&session.id, &sample(48.87, 2.30, 400_000, Some(30.0)))
            .await;
        assert_eq!(outcome, SampleOutcome::Ignored);

        let after = h.manager.recompute_stats(&session.id).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(h.store.points_for_session(&session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_background_batch_after_stop_is_dropped() {
        let h = harness(true, true, true);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        h.manager.cancel_session(&session.id).await.unwrap();
        assert!(!h.device.is_delivering(BACKGROUND_TASK_NAME));
        assert!(
            !h.device
                .push_background_batch(BACKGROUND_TASK_NAME, vec![sample(48.85, 2.35, 0, None)])
                .await
        );
        assert!(h.store.points_for_session(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_reuses_background_registration() {
        let h = harness(true, true, true);
        let first = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        h.manager.pause_session(&first.id).await.unwrap();
        h.manager.resume_session(&first.id).await.unwrap();
        h.manager
            .complete_session(&first.id, None, None)
            .await
            .unwrap();
        h.manager
            .start_session(&MissionId::from("mission-2"), &driver(), None, None)
            .await
            .unwrap();
        assert_eq!(h.device.registered_task_count(), 1);
        assert!(h.device.is_delivering(BACKGROUND_TASK_NAME));
    }

    #[tokio::test]
    async fn test_complete_finalizes_stats() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        h.device.push_sample(sample(48.8566, 2.3522, 0, Some(0.0))).await;
        h.device.push_sample(sample(48.8606, 2.3376, 300_000, Some(5.0))).await;
        let done = h
            .manager
            .complete_session(&session.id, None, None)
            .await
            .unwrap();
        let stats = done.stats.unwrap();
        assert_eq!(stats.total_duration_minutes, 5);
        assert_eq!(stats.points_count, 2);
    }

    #[tokio::test]
    async fn test_public_token_lookup() {
        let h = harness(true, true, false);
        let session = h
            .manager
            .start_session(&mission(), &driver(), None, None)
            .await
            .unwrap();
        let token = session.public_token.clone().unwrap();
        let found = h.manager.find_by_public_token(&token).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert!(h.manager.find_by_public_token("nope").await.unwrap().is_none());
    }
}
