//! Shared result cache (L2).
//!
//! [`SharedStore`] is the backend seam: anything that can get and set
//! bytes with a TTL. [`SharedCache`] wraps a store and makes it safe to
//! put on the request path:
//!
//! - every operation is bounded by `op_timeout`;
//! - any error or timeout is logged, metered and read as a miss, so a
//!   backend outage only costs latency;
//! - writes are spawned and never awaited by the caller. At most
//!   `max_pending_writes` run at once; extra writes are dropped.
//!
//! Deletes are awaited so that invalidation is done when the call returns,
//! but they are still bounded and fail soft.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use super::CacheKey;
use crate::telemetry;
use crate::types::Payload;
use crate::{OrreryError, Result};

/// A value read from a shared store.
#[derive(Debug, Clone)]
pub struct SharedHit {
    pub value: Payload,
    /// Remaining lifetime reported by the store, when it knows it.
    pub ttl_remaining: Option<Duration>,
}

/// Backend for the shared cache.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Backend name for logs and metric labels.
    fn name(&self) -> &str;

    /// Read a value. `Ok(None)` is a miss.
    async fn get(&self, key: &CacheKey) -> Result<Option<SharedHit>>;

    /// Write a value expiring after `ttl`.
    async fn put(&self, key: &CacheKey, value: &Payload, ttl: Duration) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, key: &CacheKey) -> Result<()>;

    /// Remove every value this crate has stored.
    async fn clear(&self) -> Result<()>;
}

/// Configuration for [`SharedCache`].
#[derive(Debug, Clone)]
pub struct SharedCacheConfig {
    /// Upper bound on any single store operation. Default: 100ms.
    pub op_timeout: Duration,
    /// Writes allowed in flight before new ones are dropped. Default: 64.
    pub max_pending_writes: usize,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(100),
            max_pending_writes: 64,
        }
    }
}

impl SharedCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn max_pending_writes(mut self, n: usize) -> Self {
        self.max_pending_writes = n;
        self
    }
}

/// Fail-soft wrapper around a [`SharedStore`].
pub struct SharedCache {
    store: Arc<dyn SharedStore>,
    op_timeout: Duration,
    write_permits: Arc<Semaphore>,
    errors: Arc<AtomicU64>,
    dropped_writes: AtomicU64,
}

impl SharedCache {
    pub fn new(store: Arc<dyn SharedStore>, config: &SharedCacheConfig) -> Self {
        Self {
            store,
            op_timeout: config.op_timeout,
            write_permits: Arc::new(Semaphore::new(config.max_pending_writes)),
            errors: Arc::new(AtomicU64::new(0)),
            dropped_writes: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.store.name()
    }

    /// Read through the store. Failures and timeouts read as `None`.
    pub async fn get(&self, key: &CacheKey) -> Option<SharedHit> {
        let result = match timeout(self.op_timeout, self.store.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(self.op_timeout)),
        };

        match result {
            Ok(Some(hit)) => {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "level" => "l2").increment(1);
                Some(hit)
            }
            Ok(None) => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "level" => "l2").increment(1);
                None
            }
            Err(err) => {
                record_failure(&self.errors, self.store.name(), "get", &err);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "level" => "l2").increment(1);
                None
            }
        }
    }

    /// Start a background write.
    ///
    /// Returns the write task, or `None` when the write was dropped because
    /// too many are already pending. Callers normally ignore the handle.
    pub fn put(&self, key: CacheKey, value: Payload, ttl: Duration) -> Option<JoinHandle<()>> {
        let Ok(permit) = Arc::clone(&self.write_permits).try_acquire_owned() else {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_WRITES_DROPPED_TOTAL).increment(1);
            debug!(%key, "shared cache write dropped, too many pending");
            return None;
        };

        let store = Arc::clone(&self.store);
        let errors = Arc::clone(&self.errors);
        let op_timeout = self.op_timeout;
        Some(tokio::spawn(async move {
            let _permit = permit;
            let result = match timeout(op_timeout, store.put(&key, &value, ttl)).await {
                Ok(result) => result,
                Err(_) => Err(timed_out(op_timeout)),
            };
            if let Err(err) = result {
                record_failure(&errors, store.name(), "put", &err);
            }
        }))
    }

    /// Remove a key. Returns `false` when the backend failed; the entry then
    /// lives until its TTL runs out.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let result = match timeout(self.op_timeout, self.store.delete(key)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(self.op_timeout)),
        };
        match result {
            Ok(()) => {
                debug!(%key, "shared cache entry deleted");
                true
            }
            Err(err) => {
                record_failure(&self.errors, self.store.name(), "delete", &err);
                false
            }
        }
    }

    /// Remove every entry. Not bounded by `op_timeout`, since a large
    /// store may need many round trips. Returns `false` on failure.
    pub async fn clear(&self) -> bool {
        match self.store.clear().await {
            Ok(()) => true,
            Err(err) => {
                record_failure(&self.errors, self.store.name(), "clear", &err);
                false
            }
        }
    }

    /// Failed or timed-out operations so far.
    pub fn backend_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Writes dropped at the pending-write cap so far.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }
}

fn timed_out(budget: Duration) -> OrreryError {
    OrreryError::CacheBackendUnavailable(format!("operation timed out after {budget:?}"))
}

fn record_failure(errors: &AtomicU64, backend: &str, op: &'static str, err: &OrreryError) {
    errors.fetch_add(1, Ordering::Relaxed);
    metrics::counter!(
        telemetry::CACHE_BACKEND_ERRORS_TOTAL,
        "backend" => backend.to_string(),
        "op" => op
    )
    .increment(1);
    warn!(backend, op, error = %err, "shared cache operation failed");
}

/// In-process [`SharedStore`].
///
/// Useful for tests and single-node deployments that still want the L2
/// code path (e.g. a larger, longer-lived tier behind a small L1).
/// Expired values are dropped on read.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<CacheKey, (Payload, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<SharedHit>> {
        let now = Instant::now();
        let hit = self.entries.get(key).and_then(|entry| {
            let (value, expires_at) = entry.value();
            (now < *expires_at).then(|| SharedHit {
                value: value.clone(),
                ttl_remaining: Some(*expires_at - now),
            })
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| now >= *expires_at);
        }
        Ok(hit)
    }

    async fn put(&self, key: &CacheKey, value: &Payload, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.clone(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
