//! Known-missing segment cache
//!
//! Articles reported absent on all providers are remembered for a while so
//! the pipeline's pre-check can short-circuit them instead of re-asking
//! every provider. Entries expire after a TTL and the cache is bounded;
//! when full, the oldest entries are evicted first.
//!
//! Process-wide: one instance is created at startup and shared.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::types::MessageId;

/// Default entry lifetime
const DEFAULT_TTL_HOURS: i64 = 24;

/// Default capacity
const DEFAULT_CAPACITY: usize = 100_000;

/// Bounded TTL cache of message-ids known to be missing
pub struct MissingSegmentCache {
    inner: std::sync::Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for MissingSegmentCache {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_TTL_HOURS), DEFAULT_CAPACITY)
    }
}

impl MissingSegmentCache {
    /// Create a cache with an explicit TTL and capacity
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record a message-id as missing
    pub fn record(&self, message_id: &MessageId) {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if map.len() >= self.capacity && !map.contains_key(message_id.as_str()) {
            evict_oldest(&mut map, self.capacity / 10 + 1);
        }
        map.insert(message_id.as_str().to_string(), Utc::now());
    }

    /// Whether the message-id is currently known missing
    pub fn contains(&self, message_id: &MessageId) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match map.get(message_id.as_str()) {
            Some(recorded) if Utc::now() - *recorded < self.ttl => true,
            Some(_) => {
                map.remove(message_id.as_str());
                false
            }
            None => false,
        }
    }

    /// Number of live entries (expired entries may still be counted until touched)
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether the cache has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest(map: &mut HashMap<String, DateTime<Utc>>, count: usize) {
    let mut entries: Vec<(String, DateTime<Utc>)> =
        map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by_key(|(_, at)| *at);
    for (key, _) in entries.into_iter().take(count) {
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reports_missing() {
        let cache = MissingSegmentCache::default();
        let id = MessageId::new("gone@x");
        assert!(!cache.contains(&id));
        cache.record(&id);
        assert!(cache.contains(&id));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = MissingSegmentCache::new(Duration::zero(), 100);
        let id = MessageId::new("gone@x");
        cache.record(&id);
        // Zero TTL: expired on first lookup, and the entry is removed
        assert!(!cache.contains(&id));
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = MissingSegmentCache::new(Duration::hours(1), 10);
        for i in 0..50 {
            cache.record(&MessageId::new(format!("m{i}@x")));
        }
        assert!(cache.len() <= 10);
    }
}
