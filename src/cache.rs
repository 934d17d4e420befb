//! Freshness cache for normalized upstream payloads.
//!
//! Each [`CacheKey`] owns its own slot behind an async `RwLock`, so readers of
//! one key never contend with writers of another and never observe a
//! half-replaced entry. Entries are not evicted when their TTL passes; stale
//! entries stay readable so the dispatcher can fall back to them.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::{CacheKey, PricePoint, SnapshotPrice};

/// A cached payload together with when it was fetched and how long it stays fresh.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub payload: V,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// `now - fetched_at < ttl`
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    /// Time left before the entry goes stale (zero once stale).
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }
}

type Slot<V> = Arc<RwLock<Option<CacheEntry<V>>>>;

/// Per-key store of cache entries.
pub struct FreshnessCache<V> {
    slots: Cache<CacheKey, Slot<V>>,
}

impl<V> FreshnessCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `max_keys` distinct keys.
    pub fn new(max_keys: u64) -> Self {
        Self {
            slots: Cache::builder().max_capacity(max_keys).build(),
        }
    }

    /// Read the entry for `key`, fresh or stale.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let slot = self.slots.get(key)?;
        let guard = slot.read().await;
        guard.clone()
    }

    /// Replace the entry for `key` wholesale and return the stored entry.
    pub async fn put(&self, key: &CacheKey, payload: V, ttl: Duration) -> CacheEntry<V> {
        let slot = self
            .slots
            .get_with_by_ref(key, || Arc::new(RwLock::new(None)));
        let entry = CacheEntry {
            payload,
            fetched_at: Instant::now(),
            ttl,
        };
        let mut guard = slot.write().await;
        *guard = Some(entry.clone());
        entry
    }

    /// Number of keys currently holding a slot.
    pub fn key_count(&self) -> u64 {
        self.slots.run_pending_tasks();
        self.slots.entry_count()
    }
}

/// The proxy's cache state: one typed store per payload shape.
///
/// Owned by the service instance and shared with the dispatcher by `Arc`.
pub struct ProxyCache {
    pub snapshots: FreshnessCache<Arc<Vec<SnapshotPrice>>>,
    pub series: FreshnessCache<Arc<Vec<PricePoint>>>,
}

impl ProxyCache {
    pub fn new(max_keys: u64) -> Self {
        Self {
            snapshots: FreshnessCache::new(max_keys),
            series: FreshnessCache::new(max_keys),
        }
    }

    pub fn key_count(&self) -> u64 {
        self.snapshots.key_count() + self.series.key_count()
    }
}
