//! End-to-end tests for [`ChartGateway`]: caching, deduplication,
//! admission, overload and failure handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orrery::cache::{CacheKey, MemoryStore, SharedHit, SharedStore};
use orrery::{
    BirthData, CacheOutcome, CalculationError, Calculator, ChartOptions, ComputeRequest,
    ExecutorConfig, HealthStatus, MeanEphemeris, Operation, Orrery, OrreryError, Payload,
    RateLimitConfig, Result,
};

// ============================================================================
// Test calculators and stores
// ============================================================================

/// Wraps [`MeanEphemeris`], counting calls, with optional delay and
/// a number of initial failures.
#[derive(Clone)]
struct Counting {
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
    delay: Duration,
}

impl Counting {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Calculator for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn compute(&self, request: &ComputeRequest) -> std::result::Result<serde_json::Value, CalculationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CalculationError::new("ephemeris file missing"));
        }
        MeanEphemeris::new().compute(request)
    }
}

struct DownStore;

#[async_trait]
impl SharedStore for DownStore {
    fn name(&self) -> &str {
        "down"
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<SharedHit>> {
        Err(OrreryError::CacheBackendUnavailable("connection refused".into()))
    }

    async fn put(&self, _key: &CacheKey, _value: &Payload, _ttl: Duration) -> Result<()> {
        Err(OrreryError::CacheBackendUnavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<()> {
        Err(OrreryError::CacheBackendUnavailable("connection refused".into()))
    }

    async fn clear(&self) -> Result<()> {
        Err(OrreryError::CacheBackendUnavailable("connection refused".into()))
    }
}

fn ada() -> ComputeRequest {
    ComputeRequest::subject(
        BirthData::new("Ada Lovelace", 1815, 12, 10, 12, 0)
            .place("London", "GB")
            .coordinates(51.5074, -0.1278),
    )
}

fn subject(i: usize) -> ComputeRequest {
    ComputeRequest::subject(BirthData::new(format!("Subject {i}"), 1990, 1, 1, 12, 0).place("Oslo", "NO"))
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ============================================================================
// Builder
// ============================================================================

#[tokio::test]
async fn build_requires_calculator() {
    assert!(matches!(
        Orrery::builder().build(),
        Err(OrreryError::NoCalculator)
    ));
}

#[tokio::test]
async fn build_rejects_invalid_settings() {
    let zero_ttl = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .ttl(Operation::Transits, Duration::ZERO)
        .build();
    assert!(matches!(zero_ttl, Err(OrreryError::Configuration(_))));

    let no_workers = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .executor(ExecutorConfig::new().workers(0))
        .build();
    assert!(matches!(no_workers, Err(OrreryError::Configuration(_))));

    let bad_rate = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .rate_limit(RateLimitConfig::new().refill_per_second(0.0))
        .build();
    assert!(matches!(bad_rate, Err(OrreryError::Configuration(_))));

    let zero_timeout = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .request_timeout(Duration::ZERO)
        .build();
    assert!(matches!(zero_timeout, Err(OrreryError::Configuration(_))));
}

#[test]
fn build_outside_runtime_is_a_configuration_error() {
    let result = Orrery::builder().calculator(MeanEphemeris::new()).build();
    assert!(matches!(result, Err(OrreryError::Configuration(_))));
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn second_request_is_an_l1_hit() {
    let calc = Counting::new();
    let gateway = Orrery::builder().calculator(calc.clone()).build().unwrap();

    let first = gateway.serve(&ada(), "client").await.unwrap();
    assert_eq!(first.meta.cache, CacheOutcome::Computed);
    assert!(!first.meta.coalesced);

    let second = gateway.serve(&ada(), "client").await.unwrap();
    assert_eq!(second.meta.cache, CacheOutcome::L1Hit);
    assert_eq!(first.payload, second.payload);
    assert_eq!(calc.calls(), 1);

    let chart: serde_json::Value = second.payload.to_json().unwrap();
    assert_eq!(chart["name"], "Ada Lovelace");
}

#[tokio::test]
async fn equivalent_requests_share_an_entry() {
    let calc = Counting::new();
    let gateway = Orrery::builder().calculator(calc.clone()).build().unwrap();

    let messy = ComputeRequest::subject(
        BirthData::new("  ada lovelace ", 1815, 12, 10, 12, 0)
            .place("LONDON", "gb")
            .coordinates(51.507_400_000_01, -0.1278),
    );
    gateway.serve(&ada(), "client").await.unwrap();
    let served = gateway.serve(&messy, "client").await.unwrap();
    assert_eq!(served.meta.cache, CacheOutcome::L1Hit);
    assert_eq!(calc.calls(), 1);
}

#[tokio::test]
async fn l2_hit_refills_l1_without_computing() {
    let store = Arc::new(MemoryStore::new());

    let producer = Counting::new();
    let gateway_a = Orrery::builder()
        .calculator(producer.clone())
        .shared_store(store.clone())
        .build()
        .unwrap();
    gateway_a.serve(&ada(), "client").await.unwrap();
    eventually("shared write", || store.len() == 1).await;

    let consumer = Counting::new();
    let gateway_b = Orrery::builder()
        .calculator(consumer.clone())
        .shared_store(store.clone())
        .build()
        .unwrap();

    let from_l2 = gateway_b.serve(&ada(), "client").await.unwrap();
    assert_eq!(from_l2.meta.cache, CacheOutcome::L2Hit);
    let from_l1 = gateway_b.serve(&ada(), "client").await.unwrap();
    assert_eq!(from_l1.meta.cache, CacheOutcome::L1Hit);
    assert_eq!(from_l1.payload, from_l2.payload);

    assert_eq!(producer.calls(), 1);
    assert_eq!(consumer.calls(), 0);
    assert_eq!(gateway_b.stats().l2_hits, 1);
}

#[tokio::test]
async fn shared_cache_outage_never_surfaces() {
    let calc = Counting::new();
    let gateway = Orrery::builder()
        .calculator(calc.clone())
        .shared_store(Arc::new(DownStore))
        .build()
        .unwrap();

    let first = gateway.serve(&ada(), "client").await.unwrap();
    assert_eq!(first.meta.cache, CacheOutcome::Computed);
    let second = gateway.serve(&ada(), "client").await.unwrap();
    assert_eq!(second.meta.cache, CacheOutcome::L1Hit);

    eventually("backend errors recorded", || gateway.stats().backend_errors >= 2).await;
    assert_eq!(calc.calls(), 1);
    assert_eq!(gateway.health().await.shared_cache.as_deref(), Some("down"));
}

#[tokio::test]
async fn expired_entries_are_recomputed() {
    let calc = Counting::new();
    let gateway = Orrery::builder()
        .calculator(calc.clone())
        .ttl(Operation::Subject, Duration::from_millis(100))
        .build()
        .unwrap();

    gateway.serve(&ada(), "client").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let again = gateway.serve(&ada(), "client").await.unwrap();

    assert_eq!(again.meta.cache, CacheOutcome::Computed);
    assert_eq!(calc.calls(), 2);
}

// ============================================================================
// Single flight
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_compute_once() {
    let calc = Counting::new().delay(Duration::from_millis(200));
    let gateway = Arc::new(
        Orrery::builder()
            .calculator(calc.clone())
            .disable_rate_limit()
            .build()
            .unwrap(),
    );

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.serve(&ada(), &format!("client-{i}")).await })
        })
        .collect();

    let mut payloads = Vec::new();
    for task in tasks {
        let served = task.await.unwrap().unwrap();
        assert_ne!(served.meta.cache, CacheOutcome::L2Hit);
        payloads.push(served.payload);
    }

    assert_eq!(calc.calls(), 1);
    assert!(payloads.windows(2).all(|w| w[0] == w[1]));

    let stats = gateway.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.requests, 50);
    assert_eq!(stats.l1_hits + stats.computed, 50);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_reach_all_waiters_and_are_not_cached() {
    let calc = Counting::new().delay(Duration::from_millis(100)).failing(1);
    let gateway = Arc::new(
        Orrery::builder()
            .calculator(calc.clone())
            .disable_rate_limit()
            .build()
            .unwrap(),
    );

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.serve(&ada(), "client").await })
        })
        .collect();
    for task in tasks {
        match task.await.unwrap() {
            Err(OrreryError::ComputeFailed(msg)) => assert!(msg.contains("ephemeris file missing")),
            other => panic!("expected ComputeFailed, got {other:?}"),
        }
    }
    assert_eq!(calc.calls(), 1);

    let retried = gateway.serve(&ada(), "client").await.unwrap();
    assert_eq!(retried.meta.cache, CacheOutcome::Computed);
    assert_eq!(calc.calls(), 2);
    assert_eq!(gateway.stats().compute_failures, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_detaches_without_cancelling() {
    let calc = Counting::new().delay(Duration::from_millis(300));
    let gateway = Orrery::builder()
        .calculator(calc.clone())
        .request_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    match gateway.serve(&ada(), "client").await {
        Err(OrreryError::ComputeTimeout { budget }) => {
            assert_eq!(budget, Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    eventually("background computation to fill l1", || gateway.stats().in_flight == 0).await;
    let later = gateway.serve(&ada(), "client").await.unwrap();
    assert_eq!(later.meta.cache, CacheOutcome::L1Hit);
    assert_eq!(calc.calls(), 1);
    assert_eq!(gateway.stats().compute_timeouts, 1);
}

// ============================================================================
// Overload
// ============================================================================

#[tokio::test]
async fn admission_rejects_over_rate_clients() {
    let gateway = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .rate_limit(RateLimitConfig::new().capacity(2.0).refill_per_second(0.01))
        .build()
        .unwrap();

    let first = gateway.serve(&ada(), "greedy").await.unwrap();
    let status = first.meta.rate_limit.expect("rate limit status");
    assert_eq!(status.remaining, 1);

    gateway.serve(&ada(), "greedy").await.unwrap();
    match gateway.serve(&ada(), "greedy").await {
        Err(err @ OrreryError::AdmissionRejected { .. }) => {
            let retry_after = err.retry_after().expect("retry hint");
            assert!(retry_after > Duration::from_secs(90));
            assert!(err.is_transient());
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Other clients are unaffected, and a rejection is never cached.
    assert!(gateway.serve(&ada(), "polite").await.is_ok());
    assert_eq!(gateway.rate_limit_status("greedy").unwrap().remaining, 0);
    assert_eq!(gateway.stats().rate_limited, 1);
}

#[tokio::test]
async fn disabled_rate_limit_reports_no_status() {
    let gateway = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .disable_rate_limit()
        .build()
        .unwrap();
    let served = gateway.serve(&ada(), "anyone").await.unwrap();
    assert!(served.meta.rate_limit.is_none());
    assert!(gateway.rate_limit_status("anyone").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturated_executor_fails_fast() {
    let calc = Counting::new().delay(Duration::from_millis(500));
    let gateway = Arc::new(
        Orrery::builder()
            .calculator(calc.clone())
            .disable_rate_limit()
            .executor(ExecutorConfig::new().workers(1).queue_capacity(1))
            .build()
            .unwrap(),
    );

    let running = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.serve(&subject(1), "c").await })
    };
    eventually("worker busy", || gateway.stats().busy_workers == 1).await;

    let queued = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.serve(&subject(2), "c").await })
    };
    eventually("job queued", || gateway.stats().queue_depth == 1).await;

    let start = std::time::Instant::now();
    match gateway.serve(&subject(3), "c").await {
        Err(OrreryError::ExecutorSaturated { capacity }) => assert_eq!(capacity, 1),
        other => panic!("expected saturation, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(250));

    assert!(running.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
    assert_eq!(gateway.stats().executor_saturated, 1);

    // Saturation is not cached either.
    assert!(gateway.serve(&subject(3), "c").await.is_ok());
}

// ============================================================================
// Batch, health, stats, shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serve_batch_preserves_order() {
    let calc = Counting::new();
    let gateway = Orrery::builder().calculator(calc.clone()).build().unwrap();

    let natal = ComputeRequest::natal_chart(
        BirthData::new("Ada Lovelace", 1815, 12, 10, 12, 0).place("London", "GB"),
        ChartOptions::default(),
    );
    let bad = ComputeRequest::subject(BirthData::new("Nobody", 2001, 2, 30, 0, 0));
    let results = gateway
        .serve_batch(&[ada(), natal.clone(), bad, ada()], "batch")
        .await;

    assert_eq!(results.len(), 4);
    let first = results[0].as_ref().unwrap();
    let second = results[1].as_ref().unwrap();
    let last = results[3].as_ref().unwrap();
    assert!(matches!(results[2], Err(OrreryError::ComputeFailed(_))));
    assert_eq!(first.payload, last.payload);
    assert_ne!(first.payload, second.payload);

    let natal_alone = gateway.serve(&natal, "batch").await.unwrap();
    assert_eq!(natal_alone.payload, second.payload);
    assert_eq!(calc.calls(), 3);
}

#[tokio::test]
async fn health_reports_healthy_and_caches_canary() {
    let gateway = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .rate_limit(RateLimitConfig::new().capacity(1.0))
        .build()
        .unwrap();

    let first = gateway.health().await;
    assert_eq!(first.status, HealthStatus::Healthy);
    assert_eq!(first.calculator, "mean-ephemeris");
    assert_eq!(first.cache, Some(CacheOutcome::Computed));
    assert!(first.error.is_none());
    assert_eq!(first.workers, 4);

    let second = gateway.health().await;
    assert_eq!(second.cache, Some(CacheOutcome::L1Hit));
    // Health checks do not spend admission tokens.
    assert_eq!(gateway.stats().rate_buckets, 0);
}

#[tokio::test]
async fn health_reports_calculator_failure() {
    let gateway = Orrery::builder()
        .calculator(Counting::new().failing(usize::MAX))
        .build()
        .unwrap();

    let report = gateway.health().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report.error.unwrap().contains("ephemeris file missing"));
    assert!(report.cache.is_none());
}

#[tokio::test]
async fn stats_track_outcomes() {
    let gateway = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .build()
        .unwrap();

    gateway.serve(&ada(), "c").await.unwrap();
    gateway.serve(&ada(), "c").await.unwrap();
    gateway.serve(&ada(), "c").await.unwrap();
    gateway.serve(&subject(1), "c").await.unwrap();

    let stats = gateway.stats();
    assert_eq!(stats.requests, 4);
    assert_eq!(stats.computed, 2);
    assert_eq!(stats.l1_hits, 2);
    assert_eq!(stats.computations, 2);
    assert_eq!(stats.rate_buckets, 1);
    assert!((stats.hit_ratio() - 0.5).abs() < 1e-9);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["l1_hits"], 2);
}

#[tokio::test]
async fn invalidation_forces_recompute() {
    let calc = Counting::new();
    let gateway = Orrery::builder().calculator(calc.clone()).build().unwrap();

    gateway.serve(&ada(), "c").await.unwrap();
    assert!(gateway.invalidate(&ada()).await);
    let again = gateway.serve(&ada(), "c").await.unwrap();
    assert_eq!(again.meta.cache, CacheOutcome::Computed);
    assert_eq!(calc.calls(), 2);
    assert_eq!(gateway.ttl_policy().ttl_for(Operation::Subject), Duration::from_secs(7200));
}

#[tokio::test]
async fn invalidation_reaches_the_shared_cache() {
    let store = Arc::new(MemoryStore::new());
    let calc = Counting::new();
    let gateway = Orrery::builder()
        .calculator(calc.clone())
        .shared_store(store.clone())
        .build()
        .unwrap();

    gateway.serve(&ada(), "c").await.unwrap();
    eventually("shared write", || store.len() == 1).await;

    assert!(gateway.invalidate(&ada()).await);
    assert!(store.is_empty());

    let again = gateway.serve(&ada(), "c").await.unwrap();
    assert_eq!(again.meta.cache, CacheOutcome::Computed);
    assert_eq!(calc.calls(), 2);
}

#[tokio::test]
async fn clear_empties_both_levels() {
    let store = Arc::new(MemoryStore::new());
    let calc = Counting::new();
    let gateway = Orrery::builder()
        .calculator(calc.clone())
        .shared_store(store.clone())
        .build()
        .unwrap();

    gateway.serve(&ada(), "c").await.unwrap();
    gateway.serve(&subject(1), "c").await.unwrap();
    eventually("shared writes", || store.len() == 2).await;

    assert!(gateway.clear().await);
    assert!(store.is_empty());

    let again = gateway.serve(&subject(1), "c").await.unwrap();
    assert_eq!(again.meta.cache, CacheOutcome::Computed);
    assert_eq!(calc.calls(), 3);
}

#[tokio::test]
async fn invalidation_with_shared_outage_still_drops_local_copy() {
    let calc = Counting::new();
    let gateway = Orrery::builder()
        .calculator(calc.clone())
        .shared_store(Arc::new(DownStore))
        .build()
        .unwrap();

    gateway.serve(&ada(), "c").await.unwrap();
    assert!(!gateway.invalidate(&ada()).await);

    let again = gateway.serve(&ada(), "c").await.unwrap();
    assert_eq!(again.meta.cache, CacheOutcome::Computed);
    assert_eq!(calc.calls(), 2);
}

#[tokio::test]
async fn shutdown_serves_cached_and_rejects_new_work() {
    let gateway = Orrery::builder()
        .calculator(MeanEphemeris::new())
        .build()
        .unwrap();
    gateway.serve(&ada(), "c").await.unwrap();

    gateway.shutdown().await;

    let cached = gateway.serve(&ada(), "c").await.unwrap();
    assert_eq!(cached.meta.cache, CacheOutcome::L1Hit);
    assert!(matches!(
        gateway.serve(&subject(9), "c").await,
        Err(OrreryError::ExecutorClosed)
    ));
}
