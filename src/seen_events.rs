use std::collections::{HashSet, VecDeque};

/// Remembers the most recent `capacity` event keys.
///
/// Realtime deliveries are at-least-once; this catches the common case of the
/// same event arriving twice in a row. Once a key is evicted it counts as new
/// again, so callers still have to check state before acting.
pub struct SeenEvents {
    keys: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        SeenEvents {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns `true` if the key was not remembered yet. Re-inserting a known
    /// key does not make it younger.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_reported() {
        let mut seen = SeenEvents::new(4);
        assert!(seen.insert("a".to_string()));
        assert!(!seen.insert("a".to_string()));
        assert!(seen.contains("a"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_oldest_key_is_evicted() {
        let mut seen = SeenEvents::new(2);
        seen.insert("a".to_string());
        seen.insert("b".to_string());
        seen.insert("c".to_string());
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_reinsert_does_not_refresh_age() {
        let mut seen = SeenEvents::new(2);
        seen.insert("a".to_string());
        seen.insert("b".to_string());
        assert!(!seen.insert("a".to_string()));
        seen.insert("c".to_string());
        // "a" was still the oldest
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut seen = SeenEvents::new(0);
        assert!(seen.insert("a".to_string()));
        assert!(seen.insert("b".to_string()));
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
    }
}
