//! Telemetry metric name constants.
//!
//! Centralised metric names for orrery operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops. For exporters that
//! poll instead, see [`ChartGateway::stats()`](crate::ChartGateway::stats).
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `orrery_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation`: request kind: "subject", "natal-chart" or "transits"
//! - `outcome`: how a request was answered: "l1", "l2", "computed" or "error"
//! - `level`: cache level: "l1" or "l2"
//! - `kind`: error kind (see [`ErrorKind::as_str`](crate::ErrorKind::as_str))

/// Total requests served by the gateway.
///
/// Labels: `operation`, `outcome`.
pub const REQUESTS_TOTAL: &str = "orrery_requests_total";

/// End-to-end request duration in seconds, admission included.
///
/// Labels: `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "orrery_request_duration_seconds";

/// Total cache hits.
///
/// Labels: `level`.
pub const CACHE_HITS_TOTAL: &str = "orrery_cache_hits_total";

/// Total cache misses.
///
/// Labels: `level`.
pub const CACHE_MISSES_TOTAL: &str = "orrery_cache_misses_total";

/// Entries evicted from the local cache for capacity reasons.
///
/// Labels: `level`.
pub const CACHE_EVICTIONS_TOTAL: &str = "orrery_cache_evictions_total";

/// Shared cache operations that failed and were degraded to a miss.
///
/// Labels: `backend`, `op` ("get" | "put").
pub const CACHE_BACKEND_ERRORS_TOTAL: &str = "orrery_cache_backend_errors_total";

/// Shared cache writes dropped because too many were already pending.
pub const CACHE_WRITES_DROPPED_TOTAL: &str = "orrery_cache_writes_dropped_total";

/// Requests that joined a computation already in flight for their key.
///
/// Labels: `operation`.
pub const COALESCED_TOTAL: &str = "orrery_singleflight_coalesced_total";

/// Requests rejected by the admission controller.
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "orrery_rate_limit_rejections_total";

/// Jobs currently waiting in the executor queue.
pub const EXECUTOR_QUEUE_DEPTH: &str = "orrery_executor_queue_depth";

/// Submissions refused because the executor queue was full.
pub const EXECUTOR_SATURATED_TOTAL: &str = "orrery_executor_saturated_total";

/// Calculator run time in seconds (successful and failed runs).
///
/// Labels: `operation`.
pub const COMPUTE_DURATION_SECONDS: &str = "orrery_compute_duration_seconds";

/// Failed computations.
///
/// Labels: `operation`, `kind`.
pub const COMPUTE_FAILURES_TOTAL: &str = "orrery_compute_failures_total";
