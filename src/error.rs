//! Orrery error types

use std::time::Duration;

/// Orrery error types.
///
/// `Clone` because a single computation outcome is fanned out to every
/// caller waiting on the same cache key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrreryError {
    // Admission / overload errors
    #[error("rate limited: client '{client_id}' exceeded {limit} tokens, retry after {retry_after:?}")]
    AdmissionRejected {
        client_id: String,
        limit: f64,
        retry_after: Duration,
    },

    #[error("compute executor saturated ({capacity} jobs queued)")]
    ExecutorSaturated { capacity: usize },

    #[error("compute executor is shut down")]
    ExecutorClosed,

    // Computation errors
    #[error("computation failed: {0}")]
    ComputeFailed(String),

    #[error("computation exceeded its {budget:?} budget")]
    ComputeTimeout { budget: Duration },

    /// Shared (L2) cache failure. Recovered locally as a cache miss and
    /// never returned from [`ChartGateway::serve`](crate::ChartGateway::serve).
    #[error("shared cache unavailable: {0}")]
    CacheBackendUnavailable(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no calculator configured")]
    NoCalculator,
}

/// Coarse classification of [`OrreryError`], stable for metric labels and
/// client-facing mapping (e.g. HTTP status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AdmissionRejected,
    ExecutorSaturated,
    ComputeFailed,
    ComputeTimeout,
    CacheBackendUnavailable,
    Internal,
}

impl ErrorKind {
    /// Label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionRejected => "admission_rejected",
            Self::ExecutorSaturated => "executor_saturated",
            Self::ComputeFailed => "compute_failed",
            Self::ComputeTimeout => "compute_timeout",
            Self::CacheBackendUnavailable => "cache_backend_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl OrreryError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdmissionRejected { .. } => ErrorKind::AdmissionRejected,
            Self::ExecutorSaturated { .. } => ErrorKind::ExecutorSaturated,
            Self::ComputeFailed(_) => ErrorKind::ComputeFailed,
            Self::ComputeTimeout { .. } => ErrorKind::ComputeTimeout,
            Self::CacheBackendUnavailable(_) => ErrorKind::CacheBackendUnavailable,
            Self::ExecutorClosed | Self::Json(_) | Self::Configuration(_) | Self::NoCalculator => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the same request may succeed if retried later.
    ///
    /// Overload signals are transient; a failed computation is not, since
    /// the calculator is deterministic for a given input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. }
                | Self::ExecutorSaturated { .. }
                | Self::ComputeTimeout { .. }
                | Self::CacheBackendUnavailable(_)
        )
    }

    /// How long the caller should wait before retrying, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AdmissionRejected { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for OrreryError {
    fn from(err: serde_json::Error) -> Self {
        OrreryError::Json(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for OrreryError {
    fn from(err: redis::RedisError) -> Self {
        OrreryError::CacheBackendUnavailable(err.to_string())
    }
}

/// Result type alias for Orrery operations
pub type Result<T> = std::result::Result<T, OrreryError>;
