//! Per-client admission control.
//!
//! One token bucket per client id. A request costs `cost` tokens; buckets
//! refill continuously at `refill_per_second` up to `capacity`. Buckets are
//! created full on first sight and swept once idle for `idle_horizon`.
//!
//! The decision is a value ([`Admission`]), never an error: the gateway
//! decides how to surface a rejection.
//!
//! # Concurrency
//!
//! Buckets live in a sharded `DashMap`; refill-and-take runs under the
//! bucket's shard lock, so two requests from one client can never spend
//! the same token.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::telemetry;

/// Token-bucket parameters.
///
/// ```rust
/// # use orrery::RateLimitConfig;
/// let config = RateLimitConfig::new().capacity(5.0).refill_per_second(1.0);
/// assert_eq!(config.cost, 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket size (burst). Default: 60.
    pub capacity: f64,
    /// Tokens added per second. Default: 1.0.
    pub refill_per_second: f64,
    /// Tokens spent per request. Default: 1.0.
    pub cost: f64,
    /// A bucket untouched this long is dropped. Default: 1 hour.
    pub idle_horizon: Duration,
    /// How often the gateway sweeps idle buckets. Default: 5 minutes.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_per_second: 1.0,
            cost: 1.0,
            idle_horizon: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn refill_per_second(mut self, rate: f64) -> Self {
        self.refill_per_second = rate;
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn idle_horizon(mut self, horizon: Duration) -> Self {
        self.idle_horizon = horizon;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(format!("rate limit capacity must be positive, got {}", self.capacity));
        }
        if !(self.refill_per_second.is_finite() && self.refill_per_second > 0.0) {
            return Err(format!(
                "rate limit refill must be positive, got {}",
                self.refill_per_second
            ));
        }
        if !(self.cost.is_finite() && self.cost > 0.0) || self.cost > self.capacity {
            return Err(format!(
                "rate limit cost must be in (0, capacity], got {}",
                self.cost
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err("rate limit sweep interval must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Token state for one client.
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, config: &RateLimitConfig) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_second).min(config.capacity);
        self.last_refill = now.max(self.last_refill);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }
}

/// Bucket state reported with every decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Bucket capacity.
    pub limit: f64,
    /// Whole requests still affordable right now.
    pub remaining: u64,
    /// Wait until the next request would be admitted; zero when it would
    /// be admitted now.
    pub retry_after: Duration,
}

impl RateLimitStatus {
    fn from_bucket(bucket: &RateBucket, config: &RateLimitConfig) -> Self {
        let remaining = (bucket.tokens / config.cost).floor().max(0.0) as u64;
        let retry_after = if bucket.tokens >= config.cost {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((config.cost - bucket.tokens) / config.refill_per_second)
        };
        Self {
            limit: config.capacity,
            remaining,
            retry_after,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(RateLimitStatus),
    Rejected(RateLimitStatus),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    pub fn status(&self) -> &RateLimitStatus {
        match self {
            Self::Admitted(status) | Self::Rejected(status) => status,
        }
    }
}

/// Token-bucket rate limiter keyed by client id.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, RateBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request from `client_id` now.
    pub fn check(&self, client_id: &str) -> Admission {
        self.check_at(client_id, Instant::now())
    }

    /// Admit or reject one request from `client_id` at `now`.
    pub fn check_at(&self, client_id: &str, now: Instant) -> Admission {
        let decide = |bucket: &mut RateBucket| {
            bucket.refill(now, &self.config);
            if bucket.tokens >= self.config.cost {
                bucket.tokens -= self.config.cost;
                Admission::Admitted(RateLimitStatus::from_bucket(bucket, &self.config))
            } else {
                Admission::Rejected(RateLimitStatus::from_bucket(bucket, &self.config))
            }
        };

        let admission = match self.buckets.get_mut(client_id) {
            Some(mut bucket) => decide(bucket.value_mut()),
            None => {
                let mut bucket = self
                    .buckets
                    .entry(client_id.to_string())
                    .or_insert_with(|| RateBucket::full(self.config.capacity, now));
                decide(bucket.value_mut())
            }
        };

        if !admission.is_admitted() {
            metrics::counter!(telemetry::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
        }
        admission
    }

    /// Current status for `client_id` without spending a token.
    pub fn peek(&self, client_id: &str) -> RateLimitStatus {
        let now = Instant::now();
        let bucket = self
            .buckets
            .get(client_id)
            .map(|b| {
                let mut b = *b;
                b.refill(now, &self.config);
                b
            })
            .unwrap_or_else(|| RateBucket::full(self.config.capacity, now));
        RateLimitStatus::from_bucket(&bucket, &self.config)
    }

    /// Drop buckets idle for at least the idle horizon. Returns how many
    /// were removed.
    ///
    /// A removed bucket would have been full again, so the next request
    /// from that client sees the same state as before the sweep.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill);
            let mut projected = *bucket;
            projected.refill(now, &self.config);
            idle < self.config.idle_horizon || projected.tokens < self.config.capacity
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
