use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots<K> = DashMap<K, Arc<Mutex<()>>>;

/// Serializes operations per key.
///
/// Callers hold the returned turn for the duration of their operation.
/// Operations for one key run one at a time, in the order they arrived
/// (tokio's mutex is fair); different keys never wait on each other.
/// A key's slot is dropped once its last turn ends with nobody waiting.
pub struct OperationQueue<K: Eq + Hash> {
    slots: Arc<Slots<K>>,
}

pub struct Turn<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<Mutex<()>>,
    key: Option<K>,
    slots: Arc<Slots<K>>,
}

impl<K> OperationQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    pub async fn enter(&self, key: &K) -> Turn<K> {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let guard = slot.clone().lock_owned().await;
        Turn {
            guard: Some(guard),
            slot,
            key: Some(key.clone()),
            slots: self.slots.clone(),
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl<K> Default for OperationQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for Turn<K> {
    fn drop(&mut self) {
        self.guard.take();
        let Some(key) = self.key.take() else {
            return;
        };
        // The map and this turn hold the only references unless someone is
        // waiting. `enter` clones under the same shard lock, so this cannot race.
        self.slots.remove_if(&key, |_, slot| {
            Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2
        });
    }
}
