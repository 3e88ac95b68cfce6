//! The serving path.
//!
//! ```text
//! serve(request, client)
//!   -> admission (token bucket per client)        -> AdmissionRejected
//!   -> key = CacheKey::for_request(request)
//!   -> L1 hit?                                     -> Served { L1Hit }
//!   -> L2 hit? (fail soft; refills L1)             -> Served { L2Hit }
//!   -> single flight on key
//!        leader task: executor.submit(calculator)  -> ExecutorSaturated
//!                     wait (compute budget)        -> ComputeTimeout / ComputeFailed
//!                     fill L1, spawn L2 write
//!        all waiters receive the leader's outcome  -> Served { Computed }
//! ```
//!
//! Failures are never cached; the next request for the key starts over.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::flight::{FlightRole, SingleFlight};
use crate::admission::{Admission, RateLimitStatus, RateLimiter};
use crate::cache::{CacheKey, LocalCache, SharedCache, TtlPolicy};
use crate::calc::Calculator;
use crate::executor::ComputeExecutor;
use crate::stats::{Counters, StatsSnapshot};
use crate::telemetry;
use crate::types::{BirthData, CacheOutcome, ComputeRequest, Operation, Payload, ResponseMeta, Served};
use crate::{ErrorKind, OrreryError, Result};

/// Shared state behind a [`ChartGateway`]. Leader tasks hold an `Arc` to
/// it so a computation outlives the caller that started it.
pub(crate) struct Inner {
    pub calculator: Arc<dyn Calculator>,
    pub ttl: TtlPolicy,
    pub local: LocalCache,
    pub shared: Option<SharedCache>,
    pub flights: SingleFlight<Payload>,
    pub limiter: Option<RateLimiter>,
    pub executor: ComputeExecutor,
    pub request_timeout: Option<Duration>,
    pub counters: Counters,
}

/// Serving layer in front of a [`Calculator`].
///
/// Built with [`Orrery::builder()`](crate::Orrery::builder). Cheap to share
/// behind an `Arc`; every method takes `&self`.
pub struct ChartGateway {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChartGateway {
    pub(crate) fn new(inner: Inner) -> Self {
        let inner = Arc::new(inner);
        let sweeper = inner
            .limiter
            .as_ref()
            .map(|limiter| spawn_sweeper(Arc::downgrade(&inner), limiter.config().sweep_interval));

        info!(
            calculator = inner.calculator.name(),
            shared_cache = inner.shared.as_ref().map(SharedCache::backend_name),
            rate_limited = inner.limiter.is_some(),
            "chart gateway ready"
        );

        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Serve one request for `client_id`.
    ///
    /// # Errors
    ///
    /// - [`OrreryError::AdmissionRejected`] when the client is over its rate
    /// - [`OrreryError::ExecutorSaturated`] when the compute queue is full
    /// - [`OrreryError::ComputeTimeout`] when the compute or request budget ran out
    /// - [`OrreryError::ComputeFailed`] when the calculator failed
    ///
    /// Shared-cache failures never surface here.
    #[instrument(skip(self, request), fields(operation = %request.operation()))]
    pub async fn serve(&self, request: &ComputeRequest, client_id: &str) -> Result<Served> {
        let start = Instant::now();
        let operation = request.operation();
        Counters::bump(&self.inner.counters.requests);

        let rate_limit = match self.admit(client_id) {
            Ok(status) => status,
            Err(err) => {
                record_request(operation, None, start);
                return Err(err);
            }
        };

        let looked_up = match self.inner.request_timeout {
            Some(budget) => tokio::time::timeout(budget, self.inner.lookup(request))
                .await
                .unwrap_or(Err(OrreryError::ComputeTimeout { budget })),
            None => self.inner.lookup(request).await,
        };

        match looked_up {
            Ok((payload, cache, coalesced)) => {
                self.inner.counters.record_outcome(cache);
                record_request(operation, Some(cache), start);
                Ok(Served {
                    payload,
                    meta: ResponseMeta {
                        cache,
                        coalesced,
                        rate_limit,
                        duration: start.elapsed(),
                    },
                })
            }
            Err(err) => {
                self.record_error(&err);
                record_request(operation, None, start);
                Err(err)
            }
        }
    }

    /// Serve several requests concurrently for one client.
    ///
    /// Each request is admitted and served on its own; results come back in
    /// input order and one failure does not affect the others.
    pub async fn serve_batch(
        &self,
        requests: &[ComputeRequest],
        client_id: &str,
    ) -> Vec<Result<Served>> {
        join_all(requests.iter().map(|request| self.serve(request, client_id))).await
    }

    /// Run a canary computation through the cache path.
    ///
    /// Bypasses admission control. The canary is cached like any other
    /// request, so after the first call this mostly checks the cache.
    pub async fn health(&self) -> HealthReport {
        let start = Instant::now();
        let canary = ComputeRequest::subject(
            BirthData::new("health_check", 2000, 1, 1, 12, 0).place("London", "GB"),
        );
        let outcome = self.inner.lookup(&canary).await;
        let executor = &self.inner.executor;

        let (status, cache, error) = match outcome {
            Ok((_, cache, _)) => (HealthStatus::Healthy, Some(cache), None),
            Err(err) => {
                warn!(error = %err, "health check failed");
                (HealthStatus::Unhealthy, None, Some(err.to_string()))
            }
        };

        HealthReport {
            status,
            calculator: self.inner.calculator.name().to_string(),
            duration: start.elapsed(),
            cache,
            error,
            workers: executor.config().workers,
            busy_workers: executor.busy_workers(),
            queue_depth: executor.queue_depth(),
            queue_capacity: executor.config().queue_capacity,
            shared_cache: self
                .inner
                .shared
                .as_ref()
                .map(|shared| shared.backend_name().to_string()),
        }
    }

    /// Current counters and gauges.
    pub fn stats(&self) -> StatsSnapshot {
        let inner = &self.inner;
        let c = &inner.counters;
        let load = |counter: &std::sync::atomic::AtomicU64| {
            counter.load(std::sync::atomic::Ordering::Relaxed)
        };
        StatsSnapshot {
            requests: load(&c.requests),
            l1_hits: load(&c.l1_hits),
            l2_hits: load(&c.l2_hits),
            computed: load(&c.computed),
            coalesced: load(&c.coalesced),
            computations: load(&c.computations),
            rate_limited: load(&c.rate_limited),
            executor_saturated: load(&c.saturated),
            compute_timeouts: load(&c.compute_timeouts),
            compute_failures: load(&c.compute_failures),
            backend_errors: inner.shared.as_ref().map_or(0, SharedCache::backend_errors),
            dropped_writes: inner.shared.as_ref().map_or(0, SharedCache::dropped_writes),
            l1_entries: inner.local.entry_count(),
            in_flight: inner.flights.in_flight(),
            queue_depth: inner.executor.queue_depth(),
            busy_workers: inner.executor.busy_workers(),
            workers: inner.executor.config().workers,
            rate_buckets: inner.limiter.as_ref().map_or(0, RateLimiter::len),
        }
    }

    /// Rate-limit status for `client_id` without spending a token.
    /// `None` when admission control is disabled.
    pub fn rate_limit_status(&self, client_id: &str) -> Option<RateLimitStatus> {
        self.inner.limiter.as_ref().map(|l| l.peek(client_id))
    }

    /// Drop the cached result for `request` from both cache levels.
    ///
    /// Returns `false` when the shared store could not be reached; its copy
    /// then lives until its TTL runs out.
    pub async fn invalidate(&self, request: &ComputeRequest) -> bool {
        let key = CacheKey::for_request(request);
        self.inner.local.invalidate(&key).await;
        let removed = match &self.inner.shared {
            Some(shared) => shared.delete(&key).await,
            None => true,
        };
        debug!(%key, removed, "cache entry invalidated");
        removed
    }

    /// Drop every cached result from both levels. Same return value as
    /// [`invalidate`](Self::invalidate).
    pub async fn clear(&self) -> bool {
        self.inner.local.clear();
        let cleared = match &self.inner.shared {
            Some(shared) => shared.clear().await,
            None => true,
        };
        info!(cleared, "caches cleared");
        cleared
    }

    /// The local cache.
    pub fn local_cache(&self) -> &LocalCache {
        &self.inner.local
    }

    /// TTLs applied when results are cached.
    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.inner.ttl
    }

    /// Stop the bucket sweeper and drain the executor.
    ///
    /// Requests arriving afterwards that need a computation fail with
    /// [`OrreryError::ExecutorClosed`]; cache hits are still served.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }
        self.inner.executor.shutdown().await;
        info!("chart gateway stopped");
    }

    fn admit(&self, client_id: &str) -> Result<Option<RateLimitStatus>> {
        let Some(limiter) = &self.inner.limiter else {
            return Ok(None);
        };
        match limiter.check(client_id) {
            Admission::Admitted(status) => Ok(Some(status)),
            Admission::Rejected(status) => {
                Counters::bump(&self.inner.counters.rate_limited);
                warn!(client_id, retry_after = ?status.retry_after, "rate limit exceeded");
                Err(OrreryError::AdmissionRejected {
                    client_id: client_id.to_string(),
                    limit: status.limit,
                    retry_after: status.retry_after,
                })
            }
        }
    }

    fn record_error(&self, err: &OrreryError) {
        let c = &self.inner.counters;
        match err.kind() {
            ErrorKind::ExecutorSaturated => Counters::bump(&c.saturated),
            ErrorKind::ComputeTimeout => Counters::bump(&c.compute_timeouts),
            ErrorKind::ComputeFailed | ErrorKind::Internal => Counters::bump(&c.compute_failures),
            ErrorKind::AdmissionRejected | ErrorKind::CacheBackendUnavailable => {}
        }
    }
}

impl Drop for ChartGateway {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }
    }
}

impl Inner {
    /// Cache lookup falling through to a coalesced computation.
    ///
    /// Returns the payload, where it came from, and whether this caller
    /// joined another caller's computation.
    async fn lookup(self: &Arc<Self>, request: &ComputeRequest) -> Result<(Payload, CacheOutcome, bool)> {
        let operation = request.operation();
        let key = CacheKey::for_request(request);

        if let Some(payload) = self.local.get(&key).await {
            debug!(%key, "l1 hit");
            return Ok((payload, CacheOutcome::L1Hit, false));
        }

        if let Some(shared) = &self.shared {
            if let Some(hit) = shared.get(&key).await {
                let policy_ttl = self.ttl.ttl_for(operation);
                let ttl = hit
                    .ttl_remaining
                    .map_or(policy_ttl, |remaining| remaining.min(policy_ttl));
                debug!(%key, ?ttl, "l2 hit, refilling l1");
                self.local.put(key, hit.value.clone(), ttl).await;
                return Ok((hit.value, CacheOutcome::L2Hit, false));
            }
        }

        let leader = Arc::clone(self);
        let flight_key = key.clone();
        let request = request.clone();
        let (role, outcome) = self
            .flights
            .run(&key, move || async move {
                leader.compute_and_store(flight_key, request).await
            })
            .await;

        let coalesced = role == FlightRole::Follower;
        if coalesced {
            Counters::bump(&self.counters.coalesced);
            metrics::counter!(telemetry::COALESCED_TOTAL, "operation" => operation.as_str())
                .increment(1);
        }
        outcome.map(|payload| (payload, CacheOutcome::Computed, coalesced))
    }

    /// Leader side of a flight: compute on the executor, then fill both
    /// cache levels.
    async fn compute_and_store(self: Arc<Self>, key: CacheKey, request: ComputeRequest) -> Result<Payload> {
        let operation = request.operation();

        // A flight for this key may have finished between our L1 miss and
        // becoming leader.
        if let Some(payload) = self.local.peek(&key).await {
            return Ok(payload);
        }

        let calculator = Arc::clone(&self.calculator);
        let submitted = self.executor.submit(move || {
            let started = std::time::Instant::now();
            let result = calculator
                .compute(&request)
                .map_err(|e| OrreryError::ComputeFailed(e.to_string()))
                .and_then(|value| Payload::from_json(&value));
            metrics::histogram!(telemetry::COMPUTE_DURATION_SECONDS, "operation" => operation.as_str())
                .record(started.elapsed().as_secs_f64());
            result
        });

        let result = match submitted {
            Ok(handle) => {
                Counters::bump(&self.counters.computations);
                handle.wait().await.and_then(|computed| computed)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(payload) => {
                let ttl = self.ttl.ttl_for(operation);
                self.local.put(key.clone(), payload.clone(), ttl).await;
                if let Some(shared) = &self.shared {
                    // Fire and forget; the write task owns its own errors.
                    drop(shared.put(key, payload.clone(), ttl));
                }
                Ok(payload)
            }
            Err(err) => {
                metrics::counter!(
                    telemetry::COMPUTE_FAILURES_TOTAL,
                    "operation" => operation.as_str(),
                    "kind" => err.kind().as_str()
                )
                .increment(1);
                warn!(%key, error = %err, "computation failed");
                Err(err)
            }
        }
    }
}

fn record_request(operation: Operation, cache: Option<CacheOutcome>, start: Instant) {
    let outcome = cache.map_or("error", |c| c.as_str());
    metrics::counter!(
        telemetry::REQUESTS_TOTAL,
        "operation" => operation.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "operation" => operation.as_str())
        .record(start.elapsed().as_secs_f64());
}

fn spawn_sweeper(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            if let Some(limiter) = &inner.limiter {
                let removed = limiter.sweep_idle(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = limiter.len(), "swept idle rate buckets");
                }
            }
        }
    })
}

/// Overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of [`ChartGateway::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub calculator: String,
    /// Time taken by the canary request.
    pub duration: Duration,
    /// Where the canary was answered from, when it succeeded.
    pub cache: Option<CacheOutcome>,
    pub error: Option<String>,
    pub workers: usize,
    pub busy_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Shared cache backend, if one is configured.
    pub shared_cache: Option<String>,
}
