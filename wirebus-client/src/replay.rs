//! Bounded replay cache.

use parking_lot::Mutex;
use std::collections::VecDeque;
use wirebus_protocol::Payload;

/// FIFO of deliveries attempted while not authenticated.
///
/// Bounded with a drop-oldest policy: once the configured maximum is
/// reached the oldest entry is discarded (and logged) to admit the new
/// one. Drained after a successful authentication.
pub struct ReplayCache {
    entries: Mutex<VecDeque<(String, Payload)>>,
    limit: usize,
}

impl ReplayCache {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    /// Appends one delivery, dropping the oldest entry when full.
    pub fn push(&self, identifier: &str, payload: Payload) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            if let Some((dropped, _)) = entries.pop_front() {
                tracing::warn!("replay cache full, dropping oldest delivery to '{}'", dropped);
            }
        }
        entries.push_back((identifier.to_string(), payload));
    }

    /// Takes every cached delivery, oldest first.
    pub fn drain(&self) -> Vec<(String, Payload)> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_order() {
        let cache = ReplayCache::new(10);
        cache.push("a.one", Payload::Value(json!(1)));
        cache.push("b.two", Payload::Value(json!(2)));
        cache.push("c.three", Payload::Value(json!(3)));

        let drained = cache.drain();
        let order: Vec<&str> = drained.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a.one", "b.two", "c.three"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let cache = ReplayCache::new(2);
        cache.push("first", Payload::Value(json!(1)));
        cache.push("second", Payload::Value(json!(2)));
        cache.push("third", Payload::Value(json!(3)));

        assert_eq!(cache.len(), 2);
        let drained = cache.drain();
        assert_eq!(drained[0].0, "second");
        assert_eq!(drained[1].0, "third");
    }

    #[test]
    fn test_limit_of_zero_keeps_one() {
        let cache = ReplayCache::new(0);
        cache.push("only", Payload::Value(json!(1)));
        assert_eq!(cache.len(), 1);
    }
}
