//! Tests for the per-client token-bucket admission controller.

use std::sync::Arc;
use std::time::Duration;

use orrery::{Admission, RateLimitConfig, RateLimiter};
use tokio::time::Instant;

fn limiter(capacity: f64, refill: f64) -> RateLimiter {
    RateLimiter::new(
        RateLimitConfig::new()
            .capacity(capacity)
            .refill_per_second(refill),
    )
}

fn close(a: Duration, b: Duration) -> bool {
    a.abs_diff(b) < Duration::from_millis(1)
}

// =========================================================================
// Config
// =========================================================================

#[test]
fn config_defaults() {
    let config = RateLimitConfig::default();
    assert_eq!(config.capacity, 60.0);
    assert_eq!(config.refill_per_second, 1.0);
    assert_eq!(config.cost, 1.0);
    assert_eq!(config.idle_horizon, Duration::from_secs(3600));
    assert_eq!(config.sweep_interval, Duration::from_secs(300));
}

// =========================================================================
// Token bucket
// =========================================================================

#[test]
fn burst_up_to_capacity_then_reject() {
    let limiter = limiter(5.0, 1.0);
    let t0 = Instant::now();

    for expected_remaining in (0..5).rev() {
        match limiter.check_at("alice", t0) {
            Admission::Admitted(status) => assert_eq!(status.remaining, expected_remaining),
            other => panic!("expected admission, got {other:?}"),
        }
    }

    match limiter.check_at("alice", t0) {
        Admission::Rejected(status) => {
            assert_eq!(status.limit, 5.0);
            assert_eq!(status.remaining, 0);
            assert!(close(status.retry_after, Duration::from_secs(1)));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn tokens_refill_over_time() {
    let limiter = limiter(5.0, 1.0);
    let t0 = Instant::now();
    for _ in 0..5 {
        assert!(limiter.check_at("alice", t0).is_admitted());
    }

    let half = limiter.check_at("alice", t0 + Duration::from_millis(500));
    assert!(!half.is_admitted());
    assert!(close(half.status().retry_after, Duration::from_millis(500)));

    assert!(limiter.check_at("alice", t0 + Duration::from_secs(1)).is_admitted());
    assert!(!limiter.check_at("alice", t0 + Duration::from_secs(1)).is_admitted());
}

#[test]
fn refill_is_capped_at_capacity() {
    let limiter = limiter(5.0, 1.0);
    let t0 = Instant::now();
    assert!(limiter.check_at("alice", t0).is_admitted());

    let later = t0 + Duration::from_secs(1000);
    let admitted = (0..10)
        .filter(|_| limiter.check_at("alice", later).is_admitted())
        .count();
    assert_eq!(admitted, 5);
}

#[test]
fn clients_are_independent() {
    let limiter = limiter(2.0, 1.0);
    let t0 = Instant::now();
    assert!(limiter.check_at("alice", t0).is_admitted());
    assert!(limiter.check_at("alice", t0).is_admitted());
    assert!(!limiter.check_at("alice", t0).is_admitted());

    assert!(limiter.check_at("bob", t0).is_admitted());
    assert_eq!(limiter.len(), 2);
}

#[test]
fn cost_above_one_spends_several_tokens() {
    let limiter = RateLimiter::new(RateLimitConfig::new().capacity(10.0).cost(4.0));
    let t0 = Instant::now();
    assert_eq!(limiter.check_at("alice", t0).status().remaining, 1);
    assert_eq!(limiter.check_at("alice", t0).status().remaining, 0);
    let rejected = limiter.check_at("alice", t0);
    assert!(!rejected.is_admitted());
    // 2 tokens left, 2 more needed at 1/s.
    assert!(close(rejected.status().retry_after, Duration::from_secs(2)));
}

#[tokio::test(start_paused = true)]
async fn peek_does_not_spend() {
    let limiter = limiter(3.0, 1.0);
    let fresh = limiter.peek("alice");
    assert_eq!(fresh.remaining, 3);
    assert_eq!(fresh.retry_after, Duration::ZERO);
    assert!(limiter.is_empty());

    assert!(limiter.check("alice").is_admitted());
    assert_eq!(limiter.peek("alice").remaining, 2);
    assert_eq!(limiter.peek("alice").remaining, 2);
}

#[tokio::test(start_paused = true)]
async fn check_follows_the_tokio_clock() {
    let limiter = limiter(1.0, 0.5);
    assert!(limiter.check("alice").is_admitted());
    assert!(!limiter.check("alice").is_admitted());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(limiter.check("alice").is_admitted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_never_overspend() {
    let limiter = Arc::new(limiter(10.0, 1.0));
    let t0 = Instant::now();

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check_at("shared", t0).is_admitted() })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

// =========================================================================
// Idle sweep
// =========================================================================

#[test]
fn sweep_removes_idle_full_buckets() {
    let limiter = RateLimiter::new(
        RateLimitConfig::new()
            .capacity(5.0)
            .refill_per_second(1.0)
            .idle_horizon(Duration::from_secs(60)),
    );
    let t0 = Instant::now();
    limiter.check_at("idle", t0);
    limiter.check_at("active", t0 + Duration::from_secs(50));

    assert_eq!(limiter.sweep_idle(t0 + Duration::from_secs(30)), 0);
    assert_eq!(limiter.sweep_idle(t0 + Duration::from_secs(61)), 1);
    assert_eq!(limiter.len(), 1);
    assert_eq!(limiter.sweep_idle(t0 + Duration::from_secs(200)), 1);
    assert!(limiter.is_empty());
}

#[test]
fn sweep_keeps_buckets_still_refilling() {
    let limiter = RateLimiter::new(
        RateLimitConfig::new()
            .capacity(5.0)
            .refill_per_second(0.001)
            .idle_horizon(Duration::from_secs(60)),
    );
    let t0 = Instant::now();
    for _ in 0..5 {
        limiter.check_at("drained", t0);
    }

    // Idle past the horizon but far from full: forgetting it would hand
    // the client a fresh burst.
    assert_eq!(limiter.sweep_idle(t0 + Duration::from_secs(120)), 0);
    assert!(!limiter.check_at("drained", t0 + Duration::from_secs(120)).is_admitted());

    assert_eq!(limiter.sweep_idle(t0 + Duration::from_secs(10_000)), 1);
}
