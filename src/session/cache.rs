//! TTL cache keyed by user or thread id
//!
//! Expiry is checked and enforced under the same lock as the read, so a
//! value past its TTL is evicted and reported as a miss in one step.

use crate::session::clock::{to_chrono, Clock};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

struct Entry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

pub struct TtlCache<K, V> {
    name: &'static str,
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

/// Per-user sample snapshots (recent transactions, balances)
pub type SnapshotCache = TtlCache<String, Value>;

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            ttl: to_chrono(ttl),
            clock,
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at >= self.ttl
    }

    /// Live value, or `None` after evicting an expired one
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let expired = match entries.get(key) {
            None => return None,
            Some(entry) => self.is_expired(entry, now),
        };

        if expired {
            entries.remove(key);
            debug!(cache = self.name, "Evicted expired entry on read");
            return None;
        }

        entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace; the TTL restarts
    pub async fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        self.entries.lock().await.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Live value with its TTL restarted, or a fresh one from `make`.
    /// Lookup and insert happen under one lock.
    pub async fn touch_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            if now - entry.inserted_at < self.ttl {
                entry.inserted_at = now;
                return entry.value.clone();
            }
            debug!(cache = self.name, "Replacing expired entry");
        }

        let value = make();
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                inserted_at: now,
            },
        );
        value
    }

    pub async fn evict(&self, key: &K) -> Option<V> {
        self.entries.lock().await.remove(key).map(|e| e.value)
    }

    /// Remove all expired entries, returning how many were removed
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now - entry.inserted_at < self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(cache = self.name, removed, "Swept expired entries");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Periodically sweep a cache. Reads still evict lazily in between.
pub fn spawn_sweeper<K, V>(cache: Arc<TtlCache<K, V>>, every: Duration) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            cache.sweep_expired().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::clock::ManualClock;

    fn cache_with_clock(ttl_secs: u64) -> (TtlCache<String, u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cache = TtlCache::new("test", Duration::from_secs(ttl_secs), clock.clone());
        (cache, clock)
    }

    #[tokio::test]
    async fn test_hit_before_ttl() {
        let (cache, clock) = cache_with_clock(60);
        cache.insert("user-1".to_string(), 7).await;
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get(&"user-1".to_string()).await, Some(7));
    }

    #[tokio::test]
    async fn test_read_past_ttl_evicts_and_misses() {
        let (cache, clock) = cache_with_clock(60);
        cache.insert("user-1".to_string(), 7).await;
        clock.advance(Duration::from_secs(60));

        assert_eq!(cache.get(&"user-1".to_string()).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_insert_restarts_ttl() {
        let (cache, clock) = cache_with_clock(60);
        cache.insert("user-1".to_string(), 1).await;
        clock.advance(Duration::from_secs(45));
        cache.insert("user-1".to_string(), 2).await;
        clock.advance(Duration::from_secs(45));
        assert_eq!(cache.get(&"user-1".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (cache, clock) = cache_with_clock(60);
        cache.insert("old".to_string(), 1).await;
        clock.advance(Duration::from_secs(61));
        cache.insert("fresh".to_string(), 2).await;

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.get(&"fresh".to_string()).await, Some(2));
        assert_eq!(cache.evict(&"fresh".to_string()).await, Some(2));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_touch_keeps_live_entry_and_replaces_expired() {
        let (cache, clock) = cache_with_clock(60);
        assert_eq!(cache.touch_or_insert_with("t".to_string(), || 1).await, 1);
        clock.advance(Duration::from_secs(45));
        assert_eq!(cache.touch_or_insert_with("t".to_string(), || 2).await, 1);
        clock.advance(Duration::from_secs(45));
        assert_eq!(cache.get(&"t".to_string()).await, Some(1));

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.touch_or_insert_with("t".to_string(), || 3).await, 3);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reads_across_boundary_never_serve_stale() {
        let (cache, clock) = cache_with_clock(10);
        let cache = Arc::new(cache);
        cache.insert("user-1".to_string(), 1).await;
        clock.advance(Duration::from_secs(10));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get(&"user-1".to_string()).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), None);
        }
    }
}
