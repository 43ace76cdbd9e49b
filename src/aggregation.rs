//! Route statistics, recomputed from the full point set of a session.

use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;

use crate::error::{Result, TrackingError};
use crate::geo;
use crate::models::{LocationPoint, RouteStats, SessionId, SessionPatch};
use crate::store::TrackingStore;

/// Sample order, with ties on `recorded_at` broken by the sample contents so
/// that the result never depends on delivery order.
fn sample_order(a: &LocationPoint, b: &LocationPoint) -> Ordering {
    a.recorded_at
        .cmp(&b.recorded_at)
        .then_with(|| a.latitude.total_cmp(&b.latitude))
        .then_with(|| a.longitude.total_cmp(&b.longitude))
        .then_with(|| {
            a.speed_kmh
                .unwrap_or(f64::NEG_INFINITY)
                .total_cmp(&b.speed_kmh.unwrap_or(f64::NEG_INFINITY))
        })
}

/// Computes route statistics, or `None` when there are fewer than two points.
///
/// Points without a reported speed count for distance but are left out of the
/// speed average and maximum.
pub fn compute_stats(points: &[LocationPoint]) -> Option<RouteStats> {
    if points.len() < 2 {
        return None;
    }

    let mut sorted: Vec<&LocationPoint> = points.iter().collect();
    sorted.sort_by(|a, b| sample_order(a, b));

    let total_distance_km: f64 = sorted
        .windows(2)
        .map(|pair| {
            geo::haversine_km(
                pair[0].latitude,
                pair[0].longitude,
                pair[1].latitude,
                pair[1].longitude,
            )
        })
        .sum();

    let first = sorted[0].recorded_at;
    let last = sorted[sorted.len() - 1].recorded_at;
    let total_duration_minutes =
        ((last - first).num_milliseconds() as f64 / 60_000.0).round() as i64;

    let speeds: Vec<f64> = sorted.iter().filter_map(|p| p.speed_kmh).collect();
    let (average_speed_kmh, max_speed_kmh) = if speeds.is_empty() {
        (0.0, 0.0)
    } else {
        let sum: f64 = speeds.iter().sum();
        let max = speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (sum / speeds.len() as f64, max)
    };

    Some(RouteStats {
        total_distance_km,
        total_duration_minutes,
        average_speed_kmh,
        max_speed_kmh,
        points_count: points.len(),
    })
}

/// Loads the points of a session, computes its statistics and writes them
/// back onto the session record.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn TrackingStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self { store }
    }

    /// Returns the stats that were written. With fewer than two points
    /// nothing is written and previously stored stats are kept.
    pub async fn recompute_stats(&self, session_id: &SessionId) -> Result<Option<RouteStats>> {
        let points = self
            .store
            .points_for_session(session_id)
            .await
            .map_err(TrackingError::AggregationReadFailed)?;

        let Some(stats) = compute_stats(&points) else {
            debug!(
                "Session {session_id} has {} point(s), stats left as they are",
                points.len()
            );
            return Ok(None);
        };

        self.store
            .update_session(session_id, &SessionPatch::stats(stats.clone()))
            .await
            .map_err(TrackingError::Store)?;
        Ok(Some(stats))
    }
}
