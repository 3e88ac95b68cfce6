//! Caching subsystem.
//!
//! Two levels keyed by the same [`CacheKey`]:
//!
//! - [`LocalCache`] (L1): in-process, bounded, LRU + per-entry TTL, backed
//!   by moka. Always present.
//!
//! - [`SharedCache`] (L2): optional, out-of-process, behind the
//!   [`SharedStore`] trait. Every failure degrades to a miss; writes are
//!   fire-and-forget. [`RedisStore`] is the production backend (feature
//!   `redis`), [`MemoryStore`] an in-process stand-in.
//!
//! Each level owns independent copies of its entries. Lifetimes come from
//! the [`TtlPolicy`], one TTL per [`Operation`].

pub mod key;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;
pub mod shared;

pub use key::{CacheKey, CanonicalHasher};
pub use local::{LocalCache, LocalCacheConfig};
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};
pub use shared::{MemoryStore, SharedCache, SharedCacheConfig, SharedHit, SharedStore};

use std::time::Duration;

use tokio::time::Instant;

use crate::types::{Operation, Payload};

/// Smallest lifetime an entry can have; keeps `expires_at > created_at`.
const MIN_TTL: Duration = Duration::from_millis(1);

/// A cached value with its lifetime.
///
/// Entries are immutable: a refresh replaces the entry rather than
/// extending it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: CacheKey,
    value: Payload,
    created_at: Instant,
    expires_at: Instant,
    size_hint: usize,
}

impl CacheEntry {
    /// Create an entry living for `ttl` from `now`.
    ///
    /// A zero `ttl` is raised to one millisecond.
    pub fn new(key: CacheKey, value: Payload, ttl: Duration, now: Instant) -> Self {
        let size_hint = key.as_str().len() + value.len();
        Self {
            key,
            value,
            created_at: now,
            expires_at: now + ttl.max(MIN_TTL),
            size_hint,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &Payload {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Approximate memory footprint in bytes.
    pub fn size_hint(&self) -> usize {
        self.size_hint
    }

    /// Full lifetime of the entry.
    pub fn time_to_live(&self) -> Duration {
        self.expires_at - self.created_at
    }

    /// Lifetime left at `now`; zero once expired.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Per-operation time-to-live.
///
/// Defaults: subject 2h, natal chart 4h, transits 30m.
///
/// ```rust
/// # use orrery::cache::TtlPolicy;
/// # use orrery::Operation;
/// # use std::time::Duration;
/// let policy = TtlPolicy::default().with(Operation::Transits, Duration::from_secs(600));
/// assert_eq!(policy.ttl_for(Operation::Transits), Duration::from_secs(600));
/// assert_eq!(policy.ttl_for(Operation::Subject), Duration::from_secs(7200));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub subject: Duration,
    pub natal_chart: Duration,
    pub transits: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            subject: Duration::from_secs(2 * 3600),
            natal_chart: Duration::from_secs(4 * 3600),
            transits: Duration::from_secs(30 * 60),
        }
    }
}

impl TtlPolicy {
    /// TTL for an operation.
    pub fn ttl_for(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Subject => self.subject,
            Operation::NatalChart => self.natal_chart,
            Operation::Transits => self.transits,
        }
    }

    /// Return a copy with the TTL for `operation` replaced.
    pub fn with(mut self, operation: Operation, ttl: Duration) -> Self {
        match operation {
            Operation::Subject => self.subject = ttl,
            Operation::NatalChart => self.natal_chart = ttl,
            Operation::Transits => self.transits = ttl,
        }
        self
    }

    /// The first operation configured with a zero TTL, if any.
    pub(crate) fn zero_ttl(&self) -> Option<Operation> {
        Operation::ALL
            .into_iter()
            .find(|op| self.ttl_for(*op).is_zero())
    }
}
