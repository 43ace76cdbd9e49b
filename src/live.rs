use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::models::{LocationPoint, MissionId, RouteStats};

/// One freshly recorded point, as pushed to live viewers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    pub server_time: DateTime<Utc>,
    pub mission_id: MissionId,
    pub point: LocationPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RouteStats>,
}

pub type LiveStream = Pin<Box<dyn futures_util::stream::Stream<Item = LiveUpdate> + Send>>;

/// Fan-out of recorded points to live viewers. Points that are too imprecise
/// or implausibly fast are kept out of the feed; they are still persisted.
#[derive(Clone)]
pub struct LiveFeed {
    updates_tx: broadcast::Sender<LiveUpdate>,
    max_accuracy_m: f64,
    max_speed_kmh: f64,
}

impl LiveFeed {
    pub fn new(capacity: usize, max_accuracy_m: f64, max_speed_kmh: f64) -> Self {
        let (updates_tx, _updates_rx) = broadcast::channel(capacity);
        Self {
            updates_tx,
            max_accuracy_m,
            max_speed_kmh,
        }
    }

    fn is_presentable(&self, point: &LocationPoint) -> bool {
        point.accuracy.is_none_or(|acc| acc <= self.max_accuracy_m)
            && point.speed_kmh.is_none_or(|spd| spd <= self.max_speed_kmh)
    }

    /// Returns whether the point passed the live filter.
    pub fn publish(
        &self,
        mission_id: &MissionId,
        point: &LocationPoint,
        stats: Option<RouteStats>,
    ) -> bool {
        if !self.is_presentable(point) {
            debug!(
                "Point {} kept out of live feed (accuracy {:?}, speed {:?})",
                point.id, point.accuracy, point.speed_kmh
            );
            return false;
        }
        let update = LiveUpdate {
            server_time: Utc::now(),
            mission_id: mission_id.clone(),
            point: point.clone(),
            stats,
        };
        // An error only means nobody is watching right now.
        let _ = self.updates_tx.send(update);
        true
    }

    /// Updates for the given missions; an empty set follows all of them.
    pub fn updates(&self, missions: HashSet<MissionId>) -> LiveStream {
        let mut updates = BroadcastStream::new(self.updates_tx.subscribe());
        Box::pin(async_stream::stream! {
            while let Some(item) = updates.next().await {
                match item {
                    Ok(update) => {
                        if missions.is_empty() || missions.contains(&update.mission_id) {
                            yield update;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("Live viewer fell behind, skipped {skipped} update(s)");
                    }
                }
            }
        })
    }
}

/// Counts a connected viewer until dropped. Moved into the viewer's stream so
/// the count follows the connection.
pub struct ViewerGuard {
    viewers: Arc<AtomicU64>,
}

impl ViewerGuard {
    pub fn new(viewers: Arc<AtomicU64>) -> Self {
        viewers.fetch_add(1, Ordering::SeqCst);
        ViewerGuard { viewers }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.viewers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::tests::point;

    #[tokio::test]
    async fn test_updates_filtered_by_mission() {
        let feed = LiveFeed::new(16, 50.0, 200.0);
        let mut stream = feed.updates([MissionId::from("m1")].into_iter().collect());

        assert!(feed.publish(&MissionId::from("m2"), &point("s2", 45.0, 4.0, 0, None), None));
        assert!(feed.publish(&MissionId::from("m1"), &point("s1", 48.0, 2.0, 0, None), None));

        let update = stream.next().await.unwrap();
        assert_eq!(update.mission_id, MissionId::from("m1"));
        assert_eq!(update.point.latitude, 48.0);
    }

    #[test]
    fn test_imprecise_and_implausible_points_are_not_published() {
        let feed = LiveFeed::new(16, 50.0, 200.0);
        let mut imprecise = point("s", 48.0, 2.0, 0, Some(30.0));
        imprecise.accuracy = Some(120.0);
        assert!(!feed.publish(&MissionId::from("m"), &imprecise, None));

        let too_fast = point("s", 48.0, 2.0, 0, Some(320.0));
        assert!(!feed.publish(&MissionId::from("m"), &too_fast, None));

        let fine = point("s", 48.0, 2.0, 0, Some(90.0));
        assert!(feed.publish(&MissionId::from("m"), &fine, None));
    }

    #[test]
    fn test_viewer_guard_counts_while_alive() {
        let viewers = Arc::new(AtomicU64::new(0));
        let a = ViewerGuard::new(viewers.clone());
        let b = ViewerGuard::new(viewers.clone());
        assert_eq!(viewers.load(Ordering::SeqCst), 2);
        drop(a);
        assert_eq!(viewers.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(viewers.load(Ordering::SeqCst), 0);
    }
}
