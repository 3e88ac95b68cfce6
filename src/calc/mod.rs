//! The computation behind the gateway.
//!
//! A [`Calculator`] turns a [`ComputeRequest`] into a JSON document. It is
//! synchronous and assumed expensive: the gateway only ever calls it from
//! an executor worker on the blocking pool, never on an async task.
//!
//! Implementations must be deterministic for a given request; the cache
//! relies on it. Workers call `compute` concurrently, so an engine that is
//! not thread-safe has to be wrapped in a mutex by its adapter.

mod ephemeris;

pub use ephemeris::MeanEphemeris;

use crate::types::ComputeRequest;

/// Failure reported by a [`Calculator`].
///
/// Converted to [`OrreryError::ComputeFailed`](crate::OrreryError::ComputeFailed)
/// and delivered to every caller waiting on the same key. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CalculationError {
    message: String,
}

impl CalculationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for CalculationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("failed to serialize result: {err}"))
    }
}

/// A deterministic, blocking chart calculator.
pub trait Calculator: Send + Sync + 'static {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Compute the result for `request`.
    fn compute(&self, request: &ComputeRequest) -> Result<serde_json::Value, CalculationError>;
}
