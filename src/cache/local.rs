//! In-process result cache (L1).
//!
//! [`LocalCache`] wraps `moka::future::Cache` with a least-recently-used
//! eviction policy and a per-entry expiry taken from each [`CacheEntry`].
//! moka's own expiry runs on the wall clock and reclaims memory in the
//! background; reads additionally check `expires_at` against the tokio
//! clock, so an entry is never returned once it is due, whatever the
//! state of moka's maintenance.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use tokio::time::Instant;
use tracing::debug;

use super::{CacheEntry, CacheKey};
use crate::telemetry;
use crate::types::Payload;

/// Configuration for the local cache.
///
/// ```rust
/// # use orrery::cache::LocalCacheConfig;
/// let config = LocalCacheConfig::new().max_entries(50_000);
/// assert_eq!(config.max_bytes, None);
/// ```
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Maximum number of entries. Default: 10,000.
    pub max_entries: u64,
    /// Byte budget. When set, entries are weighed by their size hint and
    /// the budget replaces the entry count as the bound.
    pub max_bytes: Option<u64>,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: None,
        }
    }
}

impl LocalCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Bound the cache by total bytes instead of entry count.
    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }
}

/// Per-entry expiry: every entry lives exactly its own TTL.
struct EntryExpiry;

impl Expiry<CacheKey, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.time_to_live())
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.time_to_live())
    }
}

/// Bounded LRU + TTL cache of computation results.
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<CacheKey, CacheEntry>,
}

impl LocalCache {
    pub fn new(config: &LocalCacheConfig) -> Self {
        let builder = Cache::builder()
            .name("orrery-l1")
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .eviction_listener(|_key: Arc<CacheKey>, _value: CacheEntry, cause: RemovalCause| {
                if cause == RemovalCause::Size {
                    metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "level" => "l1")
                        .increment(1);
                }
            });

        let cache = match config.max_bytes {
            Some(bytes) => builder
                .weigher(|_key: &CacheKey, entry: &CacheEntry| {
                    u32::try_from(entry.size_hint()).unwrap_or(u32::MAX)
                })
                .max_capacity(bytes)
                .build(),
            None => builder.max_capacity(config.max_entries).build(),
        };

        Self { cache }
    }

    /// Look up a live entry's payload.
    ///
    /// Emits L1 hit/miss metrics.
    pub async fn get(&self, key: &CacheKey) -> Option<Payload> {
        self.get_entry(key).await.map(|entry| entry.value().clone())
    }

    /// Look up a live entry. Expired entries read as absent and are removed.
    pub async fn get_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        match self.cache.get(key).await {
            Some(entry) if !entry.is_expired_at(now) => {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "level" => "l1").increment(1);
                Some(entry)
            }
            Some(_) => {
                debug!(%key, "l1 entry expired");
                self.remove_expired(key, now).await;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "level" => "l1").increment(1);
                None
            }
            None => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "level" => "l1").increment(1);
                None
            }
        }
    }

    /// Like [`get`](Self::get), without recording hit/miss metrics.
    pub async fn peek(&self, key: &CacheKey) -> Option<Payload> {
        let now = Instant::now();
        self.cache
            .get(key)
            .await
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
    }

    /// Store a payload for `ttl`, replacing any previous entry.
    pub async fn put(&self, key: CacheKey, value: Payload, ttl: Duration) {
        let entry = CacheEntry::new(key.clone(), value, ttl, Instant::now());
        self.cache.insert(key, entry).await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Approximate number of entries (exact after [`run_pending_tasks`](Self::run_pending_tasks)).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush moka's pending maintenance (evictions, expirations).
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Remove `key` only if the stored entry is still the expired one; a
    /// fresh entry written concurrently survives.
    async fn remove_expired(&self, key: &CacheKey, now: Instant) {
        let _ = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().is_expired_at(now) => Op::Remove,
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CanonicalHasher;
    use crate::types::Operation;

    fn key(name: &str) -> CacheKey {
        let mut hasher = CanonicalHasher::new();
        hasher.write_str("name", name);
        CacheKey::derive(Operation::Subject, &hasher)
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = LocalCache::new(&LocalCacheConfig::default());
        cache
            .put(key("a"), Payload::from(b"{}".to_vec()), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get(&key("a")).await, Some(Payload::from(b"{}".to_vec())));
        assert_eq!(cache.get(&key("b")).await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = LocalCache::new(&LocalCacheConfig::default());
        cache
            .put(key("a"), Payload::from(vec![1]), Duration::from_secs(60))
            .await;
        cache.invalidate(&key("a")).await;
        assert!(cache.get(&key("a")).await.is_none());
    }
}
