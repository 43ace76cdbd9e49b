//! Contract of the platform location service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::RawSample;

/// Name of the single background unit of work registered with the platform.
pub const BACKGROUND_TASK_NAME: &str = "background-location-task";

pub const MIN_TIME_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_TIME_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_DISTANCE_INTERVAL_M: f64 = 5.0;
pub const MAX_DISTANCE_INTERVAL_M: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == PermissionStatus::Granted
    }
}

/// Minimum spacing between two accepted samples. Bounds the number of points
/// a multi-hour mission produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub time_interval: Duration,
    pub distance_interval_m: f64,
}

impl SamplingPolicy {
    /// Values outside 2-5 s and 5-10 m are clamped into range.
    pub fn new(time_interval: Duration, distance_interval_m: f64) -> Self {
        let distance_interval_m = if distance_interval_m.is_finite() {
            distance_interval_m.clamp(MIN_DISTANCE_INTERVAL_M, MAX_DISTANCE_INTERVAL_M)
        } else {
            MAX_DISTANCE_INTERVAL_M
        };
        Self {
            time_interval: time_interval.clamp(MIN_TIME_INTERVAL, MAX_TIME_INTERVAL),
            distance_interval_m,
        }
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self::new(MIN_TIME_INTERVAL, MAX_DISTANCE_INTERVAL_M)
    }
}

/// The ongoing notification shown while location leaves the device in the
/// background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub sampling: SamplingPolicy,
    pub high_accuracy: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundOptions {
    pub sampling: SamplingPolicy,
    pub high_accuracy: bool,
    pub notification: Notification,
    pub pauses_automatically: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Receives the samples of a foreground watch.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn deliver(&self, sample: RawSample);
}

/// Receives sample batches when the platform runs the background task.
/// Nothing from the registering call stack is available here.
#[async_trait]
pub trait BackgroundHandler: Send + Sync {
    async fn handle(&self, batch: Vec<RawSample>);
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Whether the platform can run work while the app is suspended.
    fn supports_background(&self) -> bool;

    async fn request_foreground_permission(&self) -> Result<PermissionStatus>;

    async fn request_background_permission(&self) -> Result<PermissionStatus>;

    async fn watch(&self, options: WatchOptions, sink: Arc<dyn SampleSink>) -> Result<WatchId>;

    async fn clear_watch(&self, id: WatchId) -> Result<()>;

    /// Registering the same name again replaces the previous handler.
    async fn register_background_task(
        &self,
        name: &str,
        handler: Arc<dyn BackgroundHandler>,
    ) -> Result<()>;

    async fn start_background_delivery(&self, name: &str, options: BackgroundOptions)
    -> Result<()>;

    async fn stop_background_delivery(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_policy_clamps() {
        let policy = SamplingPolicy::new(Duration::from_millis(500), 1.0);
        assert_eq!(policy.time_interval, MIN_TIME_INTERVAL);
        assert_eq!(policy.distance_interval_m, MIN_DISTANCE_INTERVAL_M);

        let policy = SamplingPolicy::new(Duration::from_secs(60), 250.0);
        assert_eq!(policy.time_interval, MAX_TIME_INTERVAL);
        assert_eq!(policy.distance_interval_m, MAX_DISTANCE_INTERVAL_M);

        let policy = SamplingPolicy::new(Duration::from_secs(3), 7.5);
        assert_eq!(policy.time_interval, Duration::from_secs(3));
        assert_eq!(policy.distance_interval_m, 7.5);
    }

    #[test]
    fn test_sampling_policy_rejects_nan_distance() {
        let policy = SamplingPolicy::new(Duration::from_secs(2), f64::NAN);
        assert_eq!(policy.distance_interval_m, MAX_DISTANCE_INTERVAL_M);
    }
}
