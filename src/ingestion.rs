//! Location ingestion: raw sample in, persisted point and fresh stats out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::aggregation::Aggregator;
use crate::background::BackgroundContinuation;
use crate::error::{Result, TrackingError};
use crate::geo;
use crate::live::LiveFeed;
use crate::metrics::SampleCounters;
use crate::models::{LocationPoint, PointId, RawSample, RouteStats, SessionId, SessionStatus};
use crate::queue::OperationQueue;
use crate::source::{
    BACKGROUND_TASK_NAME, BackgroundOptions, LocationSource, Notification, SampleSink,
    SamplingPolicy, WatchId, WatchOptions,
};
use crate::store::TrackingStore;
use crate::utils;

const MS_TO_KMH: f64 = 3.6;

fn reported(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Turns a platform sample into the canonical point shape.
///
/// Negative speed, heading or accuracy is how platforms say "unknown"; those
/// become unset.
pub fn normalize(session_id: &SessionId, raw: &RawSample) -> Result<LocationPoint> {
    if !geo::is_valid_coordinate(raw.latitude, raw.longitude) {
        return Err(TrackingError::InvalidSample(format!(
            "coordinates out of range: {}, {}",
            raw.latitude, raw.longitude
        )));
    }
    let recorded_at = Some(raw.timestamp)
        .filter(|t| t.is_finite())
        .and_then(|t| DateTime::from_timestamp_millis(t.round() as i64))
        .ok_or_else(|| {
            TrackingError::InvalidSample(format!("unusable timestamp {}", raw.timestamp))
        })?;

    Ok(LocationPoint {
        id: PointId(utils::generate_id()),
        session_id: session_id.clone(),
        latitude: raw.latitude,
        longitude: raw.longitude,
        altitude: raw.altitude.filter(|a| a.is_finite()),
        accuracy: reported(raw.accuracy),
        speed_kmh: reported(raw.speed).map(|mps| mps * MS_TO_KMH),
        heading: reported(raw.heading),
        recorded_at,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Persisted; carries the stats written by the recompute, if any.
    Recorded(Option<RouteStats>),
    /// The session is missing or not active.
    Ignored,
    Failed,
}

/// The ingestion pipeline. Samples for one session are handled one at a time
/// and never interleave with that session's transitions.
#[derive(Clone)]
pub struct Ingestion {
    store: Arc<dyn TrackingStore>,
    aggregator: Aggregator,
    queue: Arc<OperationQueue<SessionId>>,
    live: LiveFeed,
    counters: Arc<SampleCounters>,
}

impl Ingestion {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        queue: Arc<OperationQueue<SessionId>>,
        live: LiveFeed,
        counters: Arc<SampleCounters>,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(store.clone()),
            store,
            queue,
            live,
            counters,
        }
    }

    /// Never fails: a sample that cannot be recorded is logged and dropped so
    /// that tracking carries on with the next one.
    pub async fn on_sample(&self, session_id: &SessionId, raw: &RawSample) -> SampleOutcome {
        match self.record(session_id, raw).await {
            Ok(SampleOutcome::Ignored) => {
                self.counters.ignored();
                SampleOutcome::Ignored
            }
            Ok(outcome) => {
                self.counters.recorded();
                outcome
            }
            Err(err) => {
                self.counters.failed();
                warn!("Dropped sample for session {session_id}: {err}");
                SampleOutcome::Failed
            }
        }
    }

    async fn record(&self, session_id: &SessionId, raw: &RawSample) -> Result<SampleOutcome> {
        let _turn = self.queue.enter(session_id).await;

        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(TrackingError::Store)?;
        let Some(session) = session else {
            debug!("Ignoring sample for unknown session {session_id}");
            return Ok(SampleOutcome::Ignored);
        };
        if session.status != SessionStatus::Active {
            debug!(
                "Ignoring late sample for session {session_id} ({})",
                session.status
            );
            return Ok(SampleOutcome::Ignored);
        }

        let point = normalize(session_id, raw)?;
        self.store
            .insert_point(&point)
            .await
            .map_err(TrackingError::IngestionWriteFailed)?;

        let stats = match self.aggregator.recompute_stats(session_id).await {
            Ok(stats) => stats,
            Err(err) => {
                // The point is stored; the next sample recomputes from scratch.
                warn!("Stats of session {session_id} not refreshed: {err}");
                None
            }
        };

        self.live.publish(&session.mission_id, &point, stats.clone());
        Ok(SampleOutcome::Recorded(stats))
    }

    pub async fn recompute_stats(&self, session_id: &SessionId) -> Result<Option<RouteStats>> {
        let _turn = self.queue.enter(session_id).await;
        self.aggregator.recompute_stats(session_id).await
    }
}

/// Foreground watch callback bound to one session.
struct ForegroundSink {
    session_id: SessionId,
    ingestion: Ingestion,
}

#[async_trait]
impl SampleSink for ForegroundSink {
    async fn deliver(&self, sample: RawSample) {
        self.ingestion.on_sample(&self.session_id, &sample).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestionPath {
    Foreground {
        session_id: SessionId,
        watch_id: WatchId,
    },
    Background {
        session_id: SessionId,
    },
}

impl IngestionPath {
    pub fn session_id(&self) -> &SessionId {
        match self {
            IngestionPath::Foreground { session_id, .. } => session_id,
            IngestionPath::Background { session_id } => session_id,
        }
    }
}

/// Owns the registration with the location source. At most one path is
/// registered at a time; the old one is always torn down before a new one is
/// set up.
pub struct IngestionControl {
    source: Arc<dyn LocationSource>,
    ingestion: Ingestion,
    background: BackgroundContinuation,
    sampling: SamplingPolicy,
    notification: Notification,
    path: Mutex<Option<IngestionPath>>,
}

impl IngestionControl {
    pub fn new(
        source: Arc<dyn LocationSource>,
        ingestion: Ingestion,
        background: BackgroundContinuation,
        sampling: SamplingPolicy,
        notification: Notification,
    ) -> Self {
        Self {
            source,
            ingestion,
            background,
            sampling,
            notification,
            path: Mutex::new(None),
        }
    }

    pub fn ingestion(&self) -> &Ingestion {
        &self.ingestion
    }

    pub async fn current_path(&self) -> Option<IngestionPath> {
        self.path.lock().await.clone()
    }

    /// Starts delivering samples for `session_id`. With background allowed
    /// the background task carries every sample, otherwise a foreground
    /// watch does. Failures degrade tracking and are logged, never returned.
    pub async fn activate(&self, session_id: &SessionId, background_allowed: bool) {
        let mut path = self.path.lock().await;
        if let Some(previous) = path.take() {
            // a registered path always belongs to an active session
            if previous.session_id() != session_id {
                warn!(
                    "Session {session_id} takes over location delivery from active session {}, \
                     which receives no more samples",
                    previous.session_id()
                );
            }
            self.teardown(previous).await;
        }

        if background_allowed {
            match self.start_background().await {
                Ok(()) => {
                    info!("Session {session_id}: background delivery started");
                    *path = Some(IngestionPath::Background {
                        session_id: session_id.clone(),
                    });
                    return;
                }
                Err(err) => warn!(
                    "Session {session_id}: background delivery refused, foreground only: {err:#}"
                ),
            }
        }

        let options = WatchOptions {
            sampling: self.sampling,
            high_accuracy: true,
        };
        let sink = Arc::new(ForegroundSink {
            session_id: session_id.clone(),
            ingestion: self.ingestion.clone(),
        });
        match self.source.watch(options, sink).await {
            Ok(watch_id) => {
                info!("Session {session_id}: foreground watch {watch_id:?} started");
                *path = Some(IngestionPath::Foreground {
                    session_id: session_id.clone(),
                    watch_id,
                });
            }
            Err(err) => error!("Session {session_id}: cannot watch location: {err:#}"),
        }
    }

    /// Tears down the registered path if it belongs to `session_id`.
    pub async fn deactivate(&self, session_id: &SessionId) {
        let mut path = self.path.lock().await;
        if path.as_ref().map(IngestionPath::session_id) == Some(session_id) {
            if let Some(previous) = path.take() {
                self.teardown(previous).await;
            }
        }
    }

    async fn start_background(&self) -> anyhow::Result<()> {
        self.background.ensure_registered(self.source.as_ref()).await?;
        let options = BackgroundOptions {
            sampling: self.sampling,
            high_accuracy: true,
            notification: self.notification.clone(),
            pauses_automatically: false,
        };
        self.source
            .start_background_delivery(BACKGROUND_TASK_NAME, options)
            .await
    }

    async fn teardown(&self, path: IngestionPath) {
        let result = match &path {
            IngestionPath::Foreground { watch_id, .. } => self.source.clear_watch(*watch_id).await,
            IngestionPath::Background { .. } => {
                self.source
                    .stop_background_delivery(BACKGROUND_TASK_NAME)
                    .await
            }
        };
        match result {
            Ok(()) => debug!("Ingestion path {path:?} torn down"),
            Err(err) => error!("Failed to tear down ingestion path {path:?}: {err:#}"),
        }
    }
}
