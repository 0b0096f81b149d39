//! Key/value store with per-entry TTL and bounded size.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::{CacheConfig, EvictionPolicy};
use super::metrics::CacheMetrics;
use crate::clock::Clock;

/// A cached payload with the data needed for TTL checks
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// An entry is live while `now - inserted_at <= ttl`
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }

    /// Time left before the entry goes stale
    pub fn remaining(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.saturating_duration_since(self.inserted_at))
    }
}

/// Cache keyed by string with lazy expiry on read.
///
/// Under [`EvictionPolicy::InsertionOrder`] reads use `peek`, so the order kept
/// by the underlying list is pure insertion order and the front of it is the
/// oldest write. Overwriting a key counts as a fresh insertion.
pub struct CacheStore<V> {
    entries: LruCache<String, CacheEntry<V>>,
    default_ttl: Duration,
    eviction: EvictionPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<CacheMetrics>,
}

impl<V: Clone> CacheStore<V> {
    /// Create a store with the given configuration and time source
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            default_ttl: config.default_ttl,
            eviction: config.eviction,
            clock,
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// Look up a live entry. A stale entry is removed and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now();

        let lookup = match self.eviction {
            EvictionPolicy::InsertionOrder => self.entries.peek(key),
            EvictionPolicy::AccessOrder => self.entries.get(key),
        };

        let expired = match lookup {
            Some(entry) if !entry.is_expired(now) => {
                self.metrics.record_hit();
                return Some(entry.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.pop(key);
            self.metrics.record_expirations(1);
            tracing::trace!(key, "Cache entry expired");
        }
        self.metrics.record_miss();
        None
    }

    /// Check for a live entry without touching metrics or eviction order
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries.peek(key).is_some_and(|entry| !entry.is_expired(now))
    }

    /// Insert or overwrite an entry with an explicit TTL.
    ///
    /// Returns the key of the entry evicted to make room, if any.
    pub fn set(&mut self, key: impl Into<String>, payload: V, ttl: Duration) -> Option<String> {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            inserted_at: self.clock.now(),
            ttl,
        };

        // Re-inserting moves the key to the newest position
        self.entries.pop(&key);
        self.metrics.record_insert();

        match self.entries.push(key, entry) {
            Some((evicted, _)) => {
                self.metrics.record_eviction();
                tracing::debug!(key = %evicted, "Evicted cache entry");
                Some(evicted)
            }
            None => None,
        }
    }

    /// Insert with the configured default TTL
    pub fn insert(&mut self, key: impl Into<String>, payload: V) -> Option<String> {
        let ttl = self.default_ttl;
        self.set(key, payload, ttl)
    }

    /// Remove an entry explicitly. Returns whether it was present.
    pub fn invalidate(&mut self, key: &str) -> bool {
        let removed = self.entries.pop(key).is_some();
        if removed {
            self.metrics.record_invalidation();
        }
        removed
    }

    /// Remove every expired entry and return how many were dropped
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        self.metrics.record_expirations(expired.len());
        expired.len()
    }

    /// Number of stored entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Shared handle to the store's metrics
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store(max_entries: usize, eviction: EvictionPolicy) -> (CacheStore<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig { max_entries, default_ttl: Duration::from_secs(60), eviction };
        (CacheStore::new(&config, clock.clone()), clock)
    }

    #[test]
    fn test_cache_hit() {
        let (mut cache, _) = store(10, EvictionPolicy::InsertionOrder);
        cache.set("meals:r1", "pasta".to_string(), Duration::from_secs(300));

        let entry = cache.get("meals:r1").unwrap();
        assert_eq!(entry.payload, "pasta");
        assert_eq!(entry.key, "meals:r1");
        assert_eq!(cache.metrics().snapshot().hits, 1);
    }

    #[test]
    fn test_cache_miss() {
        let (mut cache, _) = store(10, EvictionPolicy::InsertionOrder);
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.metrics().snapshot().misses, 1);
    }

    #[test]
    fn test_ttl_boundaries() {
        let (mut cache, clock) = store(10, EvictionPolicy::InsertionOrder);
        cache.set("k", "v".to_string(), Duration::from_millis(1000));

        clock.advance(Duration::from_millis(999));
        assert!(cache.get("k").is_some());

        // Exactly at the TTL the entry is still live
        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_some());

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_stale_entry_removed_on_read() {
        let (mut cache, clock) = store(10, EvictionPolicy::InsertionOrder);
        cache.set("k", "v".to_string(), Duration::from_millis(10));
        clock.advance(Duration::from_millis(20));

        assert_eq!(cache.len(), 1);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.metrics().snapshot().expirations, 1);
    }

    #[test]
    fn test_insertion_order_eviction() {
        let (mut cache, _) = store(3, EvictionPolicy::InsertionOrder);
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());
        cache.insert("c", "3".to_string());

        // Reading "a" must not save it under insertion order
        assert!(cache.get("a").is_some());

        let evicted = cache.insert("d", "4".to_string());
        assert_eq!(evicted.as_deref(), Some("a"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.metrics().snapshot().evictions, 1);
    }

    #[test]
    fn test_access_order_eviction() {
        let (mut cache, _) = store(3, EvictionPolicy::AccessOrder);
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());
        cache.insert("c", "3".to_string());

        assert!(cache.get("a").is_some());

        let evicted = cache.insert("d", "4".to_string());
        assert_eq!(evicted.as_deref(), Some("b"));
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_overwrite_refreshes_position() {
        let (mut cache, _) = store(2, EvictionPolicy::InsertionOrder);
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());
        assert!(cache.insert("a", "1b".to_string()).is_none());

        let evicted = cache.insert("c", "3".to_string());
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(cache.get("a").unwrap().payload, "1b");
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (mut cache, _) = store(10, EvictionPolicy::InsertionOrder);
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert!(!cache.contains("a"));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let (mut cache, clock) = store(10, EvictionPolicy::InsertionOrder);
        cache.set("short", "1".to_string(), Duration::from_millis(5));
        cache.set("long", "2".to_string(), Duration::from_secs(5));
        clock.advance(Duration::from_millis(10));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("long"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (cache, _) = store(0, EvictionPolicy::InsertionOrder);
        assert_eq!(cache.capacity(), 1);
    }
}
