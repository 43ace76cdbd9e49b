//! Background continuation: samples that arrive while the app is suspended.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{Mutex, watch};

use crate::ingestion::Ingestion;
use crate::models::{RawSample, SessionId};
use crate::source::{BACKGROUND_TASK_NAME, BackgroundHandler, LocationSource};

/// The process wide "which session is being tracked" cell.
///
/// Only the session manager holds this writer; everybody else gets a
/// [`CurrentSessionReader`]. The value is a best effort pointer for the
/// background task, never an input to aggregation.
pub struct CurrentSession {
    tx: watch::Sender<Option<SessionId>>,
}

#[derive(Clone)]
pub struct CurrentSessionReader {
    rx: watch::Receiver<Option<SessionId>>,
}

impl CurrentSession {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn reader(&self) -> CurrentSessionReader {
        CurrentSessionReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set(&self, session_id: &SessionId) {
        self.tx.send_replace(Some(session_id.clone()));
    }

    /// Clears the cell, unless another session took it over meanwhile.
    pub fn clear(&self, session_id: &SessionId) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(session_id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    pub fn get(&self) -> Option<SessionId> {
        self.tx.borrow().clone()
    }
}

impl Default for CurrentSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentSessionReader {
    pub fn get(&self) -> Option<SessionId> {
        self.rx.borrow().clone()
    }
}

/// The handler the platform invokes with sample batches.
pub struct BackgroundTask {
    current: CurrentSessionReader,
    ingestion: Ingestion,
}

#[async_trait]
impl BackgroundHandler for BackgroundTask {
    async fn handle(&self, batch: Vec<RawSample>) {
        let Some(session_id) = self.current.get() else {
            debug!("Background batch of {} sample(s) with no session, skipped", batch.len());
            return;
        };
        for sample in &batch {
            // Failures are logged by the pipeline; there is nobody to tell here.
            self.ingestion.on_sample(&session_id, sample).await;
        }
    }
}

/// Registers the background task with the location source exactly once.
pub struct BackgroundContinuation {
    task: Arc<BackgroundTask>,
    registered: Mutex<bool>,
}

impl BackgroundContinuation {
    pub fn new(current: CurrentSessionReader, ingestion: Ingestion) -> Self {
        Self {
            task: Arc::new(BackgroundTask { current, ingestion }),
            registered: Mutex::new(false),
        }
    }

    pub async fn ensure_registered(&self, source: &dyn LocationSource) -> Result<()> {
        let mut registered = self.registered.lock().await;
        if !*registered {
            source
                .register_background_task(BACKGROUND_TASK_NAME, self.task.clone())
                .await?;
            info!("Registered background task {BACKGROUND_TASK_NAME}");
            *registered = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::tests::base_time;
    use crate::device::DeviceBridge;
    use crate::live::LiveFeed;
    use crate::metrics::SampleCounters;
    use crate::models::{
        DriverId, MissionId, PermissionsRequest, SessionStatus, TrackingSessionBuilder,
    };
    use crate::queue::OperationQueue;
    use crate::store::{MemoryStore, TrackingStore};

    fn raw(seconds: i64) -> RawSample {
        RawSample {
            latitude: 48.85 + seconds as f64 * 1e-4,
            longitude: 2.35,
            altitude: None,
            accuracy: Some(5.0),
            speed: Some(10.0),
            heading: None,
            timestamp: (base_time().timestamp_millis() + seconds * 1000) as f64,
        }
    }

    async fn ingestion(store: Arc<MemoryStore>) -> Ingestion {
        let session = TrackingSessionBuilder::new()
            .with_id(SessionId::from("s"))
            .with_mission_id(MissionId::from("m"))
            .with_driver_id(DriverId::from("d"))
            .with_status(SessionStatus::Active)
            .with_started_at(base_time())
            .build();
        store.insert_session(&session).await.unwrap();
        Ingestion::new(
            store,
            Arc::new(OperationQueue::new()),
            LiveFeed::new(16, 50.0, 200.0),
            Arc::new(SampleCounters::default()),
        )
    }

    #[test]
    fn test_clear_only_for_owner() {
        let current = CurrentSession::new();
        let reader = current.reader();
        current.set(&SessionId::from("a"));
        current.clear(&SessionId::from("b"));
        assert_eq!(reader.get(), Some(SessionId::from("a")));
        current.clear(&SessionId::from("a"));
        assert_eq!(reader.get(), None);
        assert_eq!(current.get(), None);
    }

    #[tokio::test]
    async fn test_batch_without_current_session_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let current = CurrentSession::new();
        let task = BackgroundTask {
            current: current.reader(),
            ingestion: ingestion(store.clone()).await,
        };
        task.handle(vec![raw(0), raw(5)]).await;
        assert!(store.points_for_session(&SessionId::from("s")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_resolves_current_session() {
        let store = Arc::new(MemoryStore::new());
        let current = CurrentSession::new();
        let task = BackgroundTask {
            current: current.reader(),
            ingestion: ingestion(store.clone()).await,
        };
        current.set(&SessionId::from("s"));
        task.handle(vec![raw(10), raw(0), raw(5)]).await;

        let points = store.points_for_session(&SessionId::from("s")).await.unwrap();
        assert_eq!(points.len(), 3);
        let session = store.get_session(&SessionId::from("s")).await.unwrap().unwrap();
        assert_eq!(session.stats.unwrap().points_count, 3);
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let current = CurrentSession::new();
        let continuation = BackgroundContinuation::new(current.reader(), ingestion(store).await);
        let bridge = DeviceBridge::new(true);
        bridge.set_permissions(PermissionsRequest {
            foreground: true,
            background: true,
        });

        continuation.ensure_registered(&bridge).await.unwrap();
        continuation.ensure_registered(&bridge).await.unwrap();
        assert_eq!(bridge.registered_task_count(), 1);
    }
}
