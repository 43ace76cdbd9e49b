//! Mission milestones delivered by the realtime subscription layer.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::models::{DriverId, InspectionId, MissionId, Place};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectionKind {
    Departure,
    Arrival,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Delivered,
    Cancelled,
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MissionStatus::Pending => "pending",
            MissionStatus::Assigned => "assigned",
            MissionStatus::InProgress => "in_progress",
            MissionStatus::Completed => "completed",
            MissionStatus::Delivered => "delivered",
            MissionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionEvent {
    #[serde(rename_all = "camelCase")]
    InspectionCompleted {
        mission_id: MissionId,
        inspection_id: InspectionId,
        kind: InspectionKind,
        driver_id: DriverId,
        #[serde(default)]
        location: Option<Place>,
    },
    #[serde(rename_all = "camelCase")]
    MissionStatusChanged {
        mission_id: MissionId,
        status: MissionStatus,
    },
}

impl MissionEvent {
    pub fn mission_id(&self) -> &MissionId {
        match self {
            MissionEvent::InspectionCompleted { mission_id, .. } => mission_id,
            MissionEvent::MissionStatusChanged { mission_id, .. } => mission_id,
        }
    }

    /// Identical milestones share a key, whatever their delivery.
    pub fn key(&self) -> String {
        match self {
            MissionEvent::InspectionCompleted {
                inspection_id,
                kind,
                ..
            } => format!("inspection:{inspection_id}:{kind:?}"),
            MissionEvent::MissionStatusChanged { mission_id, status } => {
                format!("mission:{mission_id}:{status}")
            }
        }
    }

    /// Key under which a handled milestone is remembered. A mission can reach
    /// the same status again with a later session, so status changes have none.
    pub fn dedupe_key(&self) -> Option<String> {
        match self {
            MissionEvent::InspectionCompleted { .. } => Some(self.key()),
            MissionEvent::MissionStatusChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Inspections,
    MissionStatus,
}

impl EventFilter {
    pub fn matches(self, event: &MissionEvent) -> bool {
        matches!(
            (self, event),
            (EventFilter::Inspections, MissionEvent::InspectionCompleted { .. })
                | (EventFilter::MissionStatus, MissionEvent::MissionStatusChanged { .. })
        )
    }
}

/// A live subscription. Dropping it (or calling [`Subscription::unsubscribe`])
/// ends delivery.
pub struct Subscription {
    events: BoxStream<'static, MissionEvent>,
}

impl Subscription {
    pub fn new(events: BoxStream<'static, MissionEvent>) -> Self {
        Self { events }
    }

    pub async fn next(&mut self) -> Option<MissionEvent> {
        self.events.next().await
    }

    pub fn unsubscribe(self) {}
}

#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    async fn subscribe(&self, filters: &[EventFilter]) -> anyhow::Result<Subscription>;
}

/// In-process realtime bus; the device and back office publish through the
/// HTTP API.
#[derive(Clone)]
pub struct EventBus {
    events_tx: broadcast::Sender<MissionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(capacity);
        Self { events_tx }
    }

    /// Returns the number of subscriptions the event reached.
    pub fn publish(&self, event: MissionEvent) -> usize {
        self.events_tx.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl RealtimeFeed for EventBus {
    async fn subscribe(&self, filters: &[EventFilter]) -> anyhow::Result<Subscription> {
        let filters = filters.to_vec();
        let events = BroadcastStream::new(self.events_tx.subscribe()).filter_map(move |item| {
            let wanted = match item {
                Ok(event) if filters.iter().any(|f| f.matches(&event)) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Realtime subscriber lagged, {skipped} event(s) lost");
                    None
                }
            };
            futures::future::ready(wanted)
        });
        Ok(Subscription::new(events.boxed()))
    }
}
