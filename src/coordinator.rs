//! Starts and stops tracking from mission milestones, without driver action.

use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::TrackingError;
use crate::events::{EventFilter, InspectionKind, MissionEvent, MissionStatus, RealtimeFeed};
use crate::manager::SessionManager;
use crate::models::SessionId;
use crate::seen_events::SeenEvents;

const SEEN_EVENTS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Started(SessionId),
    Completed(SessionId),
    Cancelled(SessionId),
    Skipped,
    Failed,
}

pub struct AutoCoordinator {
    manager: Arc<SessionManager>,
    seen: SeenEvents,
}

impl AutoCoordinator {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            seen: SeenEvents::new(SEEN_EVENTS),
        }
    }

    /// Subscribes to the feed and handles its events until the returned
    /// handle is shut down or dropped.
    pub async fn start(
        manager: Arc<SessionManager>,
        feed: &dyn RealtimeFeed,
    ) -> anyhow::Result<CoordinatorHandle> {
        let mut subscription = feed
            .subscribe(&[EventFilter::Inspections, EventFilter::MissionStatus])
            .await?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut coordinator = AutoCoordinator::new(manager);

        let task = tokio::spawn(async move {
            info!("Auto start/stop coordinator running");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = subscription.next() => match event {
                        Some(event) => {
                            coordinator.handle(&event).await;
                        }
                        None => break,
                    },
                }
            }
            subscription.unsubscribe();
            info!("Auto start/stop coordinator stopped");
        });

        Ok(CoordinatorHandle {
            task,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Reacts to one milestone. Handling the same milestone twice is a no-op.
    pub async fn handle(&mut self, event: &MissionEvent) -> Action {
        let key = event.dedupe_key();
        if let Some(key) = &key {
            if self.seen.contains(key) {
                debug!("Duplicate event {key} skipped");
                return Action::Skipped;
            }
        }

        let action = match event {
            MissionEvent::InspectionCompleted {
                mission_id,
                inspection_id,
                kind: InspectionKind::Departure,
                driver_id,
                location,
            } => {
                // a paused session still owns the mission
                match self.manager.get_open_session(mission_id).await {
                    Ok(Some(open)) => {
                        debug!("Mission {mission_id} already tracked by {}", open.id);
                        Action::Skipped
                    }
                    Ok(None) => match self
                        .manager
                        .start_session(
                            mission_id,
                            driver_id,
                            Some(inspection_id.clone()),
                            location.clone(),
                        )
                        .await
                    {
                        Ok(session) => Action::Started(session.id),
                        Err(TrackingError::AlreadyActive { .. }) => Action::Skipped,
                        Err(err) => {
                            error!("Could not start tracking mission {mission_id}: {err}");
                            Action::Failed
                        }
                    },
                    Err(err) => {
                        error!("Could not look up mission {mission_id}: {err}");
                        Action::Failed
                    }
                }
            }
            MissionEvent::InspectionCompleted { .. } => Action::Skipped,
            MissionEvent::MissionStatusChanged { status, .. } => match status {
                MissionStatus::Completed | MissionStatus::Delivered | MissionStatus::Cancelled => {
                    self.stop(event, *status).await
                }
                _ => Action::Skipped,
            },
        };

        if let Some(key) = key {
            if action != Action::Failed {
                self.seen.insert(key);
            }
        }
        action
    }

    async fn stop(&self, event: &MissionEvent, status: MissionStatus) -> Action {
        let mission_id = event.mission_id();
        let session = match self.manager.get_open_session(mission_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("Mission {mission_id} is {status}, nothing tracked");
                return Action::Skipped;
            }
            Err(err) => {
                error!("Could not look up mission {mission_id}: {err}");
                return Action::Failed;
            }
        };

        let result = if status == MissionStatus::Cancelled {
            self.manager
                .cancel_session(&session.id)
                .await
                .map(|s| Action::Cancelled(s.id))
        } else {
            self.manager
                .complete_session(&session.id, None, None)
                .await
                .map(|s| Action::Completed(s.id))
        };
        match result {
            Ok(action) => action,
            // finished concurrently by the driver
            Err(TrackingError::InvalidTransition { .. }) => Action::Skipped,
            Err(err) => {
                error!("Could not stop tracking mission {mission_id}: {err}");
                Action::Failed
            }
        }
    }
}

/// Keeps the coordinator alive. Dropping it aborts the coordinator.
pub struct CoordinatorHandle {
    task: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl CoordinatorHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            if !err.is_cancelled() {
                error!("Coordinator task failed: {err}");
            }
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
