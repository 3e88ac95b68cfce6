//! Pull-based statistics.
//!
//! The `metrics` facade covers push and scrape exporters; [`StatsSnapshot`]
//! is for callers that want numbers directly (health endpoints, the bench
//! CLI, tests).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::CacheOutcome;

/// Running totals kept by the gateway.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub requests: AtomicU64,
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub computed: AtomicU64,
    pub coalesced: AtomicU64,
    pub computations: AtomicU64,
    pub rate_limited: AtomicU64,
    pub saturated: AtomicU64,
    pub compute_timeouts: AtomicU64,
    pub compute_failures: AtomicU64,
}

impl Counters {
    pub fn record_outcome(&self, outcome: CacheOutcome) {
        let counter = match outcome {
            CacheOutcome::L1Hit => &self.l1_hits,
            CacheOutcome::L2Hit => &self.l2_hits,
            CacheOutcome::Computed => &self.computed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of gateway activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Requests received, rejected ones included.
    pub requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    /// Requests answered by a computation (their own or a coalesced one).
    pub computed: u64,
    /// Requests that joined another caller's computation.
    pub coalesced: u64,
    /// Calculator invocations.
    pub computations: u64,
    pub rate_limited: u64,
    pub executor_saturated: u64,
    pub compute_timeouts: u64,
    pub compute_failures: u64,
    pub backend_errors: u64,
    pub dropped_writes: u64,
    /// Entries in the local cache (approximate).
    pub l1_entries: u64,
    /// Keys with a computation in flight.
    pub in_flight: usize,
    pub queue_depth: usize,
    pub busy_workers: usize,
    pub workers: usize,
    /// Clients with a live rate bucket.
    pub rate_buckets: usize,
}

impl StatsSnapshot {
    /// Share of answered requests served from either cache level.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let answered = hits + self.computed;
        if answered == 0 {
            0.0
        } else {
            hits as f64 / answered as f64
        }
    }
}
