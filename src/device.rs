//! The driver's device as a location source.
//!
//! The device pushes its samples, permission grants and background batches
//! over HTTP. The bridge routes them to whatever the engine registered, and
//! drops them when nothing is registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};

use crate::models::{PermissionsRequest, RawSample};
use crate::source::{
    BackgroundHandler, BackgroundOptions, LocationSource, Notification, PermissionStatus,
    SampleSink, WatchId, WatchOptions,
};

#[derive(Default)]
struct BridgeState {
    permissions: PermissionsRequest,
    next_watch_id: u64,
    watches: HashMap<WatchId, (WatchOptions, Arc<dyn SampleSink>)>,
    tasks: HashMap<String, Arc<dyn BackgroundHandler>>,
    deliveries: HashMap<String, BackgroundOptions>,
}

pub struct DeviceBridge {
    mobile: bool,
    state: Mutex<BridgeState>,
}

impl DeviceBridge {
    /// `mobile` tells whether the device can run a background task at all.
    pub fn new(mobile: bool) -> Self {
        Self {
            mobile,
            state: Mutex::new(BridgeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        // The state stays consistent even if a holder panicked; every
        // mutation is a single map operation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_permissions(&self, permissions: PermissionsRequest) {
        info!(
            "Device permissions: foreground={} background={}",
            permissions.foreground, permissions.background
        );
        self.state().permissions = permissions;
    }

    /// Hands a foreground sample to every live watch. Returns `false` when no
    /// watch is registered.
    pub async fn push_sample(&self, sample: RawSample) -> bool {
        let sinks: Vec<Arc<dyn SampleSink>> = self
            .state()
            .watches
            .values()
            .map(|(_, sink)| sink.clone())
            .collect();
        if sinks.is_empty() {
            debug!("Dropping sample, no watch registered");
            return false;
        }
        for sink in sinks {
            sink.deliver(sample.clone()).await;
        }
        true
    }

    /// Runs the named background task with a batch, provided the task is
    /// registered and its delivery was started.
    pub async fn push_background_batch(&self, name: &str, batch: Vec<RawSample>) -> bool {
        let handler = {
            let state = self.state();
            if !state.deliveries.contains_key(name) {
                None
            } else {
                state.tasks.get(name).cloned()
            }
        };
        match handler {
            Some(handler) => {
                handler.handle(batch).await;
                true
            }
            None => {
                debug!("Dropping background batch, {name} is not delivering");
                false
            }
        }
    }

    #[cfg(test)]
    pub fn watch_count(&self) -> usize {
        self.state().watches.len()
    }

    #[cfg(test)]
    pub fn is_delivering(&self, name: &str) -> bool {
        self.state().deliveries.contains_key(name)
    }

    #[cfg(test)]
    pub fn registered_task_count(&self) -> usize {
        self.state().tasks.len()
    }

    /// The persistent indicator currently shown to the user, if any.
    pub fn notification(&self) -> Option<Notification> {
        self.state()
            .deliveries
            .values()
            .next()
            .map(|options| options.notification.clone())
    }
}

#[async_trait]
impl LocationSource for DeviceBridge {
    fn supports_background(&self) -> bool {
        self.mobile
    }

    async fn request_foreground_permission(&self) -> Result<PermissionStatus> {
        Ok(if self.state().permissions.foreground {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        })
    }

    async fn request_background_permission(&self) -> Result<PermissionStatus> {
        Ok(if self.mobile && self.state().permissions.background {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        })
    }

    async fn watch(&self, options: WatchOptions, sink: Arc<dyn SampleSink>) -> Result<WatchId> {
        let mut state = self.state();
        let id = WatchId(state.next_watch_id);
        state.next_watch_id += 1;
        state.watches.insert(id, (options, sink));
        Ok(id)
    }

    async fn clear_watch(&self, id: WatchId) -> Result<()> {
        self.state().watches.remove(&id);
        Ok(())
    }

    async fn register_background_task(
        &self,
        name: &str,
        handler: Arc<dyn BackgroundHandler>,
    ) -> Result<()> {
        self.state().tasks.insert(name.to_string(), handler);
        Ok(())
    }

    async fn start_background_delivery(
        &self,
        name: &str,
        options: BackgroundOptions,
    ) -> Result<()> {
        if !self.mobile {
            anyhow::bail!("This platform has no background execution");
        }
        let mut state = self.state();
        if !state.permissions.background {
            anyhow::bail!("Background location was not granted by the device");
        }
        if !state.tasks.contains_key(name) {
            anyhow::bail!("No background task registered under {name}");
        }
        state.deliveries.insert(name.to_string(), options);
        Ok(())
    }

    async fn stop_background_delivery(&self, name: &str) -> Result<()> {
        self.state().deliveries.remove(name);
        Ok(())
    }
}
