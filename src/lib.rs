//! Orrery - serving layer for expensive chart calculations
//!
//! This crate puts a request-serving layer in front of a slow, deterministic,
//! blocking calculation (astrological subject, natal chart and transit
//! computation). It keeps latency low, protects the calculator from
//! overload and never computes the same thing twice at once:
//!
//! - a two-level result cache: in-process LRU + TTL, plus an optional
//!   shared store (Redis) that fails soft;
//! - single-flight deduplication of concurrent identical requests;
//! - a per-client token-bucket admission controller;
//! - a bounded compute executor that fails fast when saturated.
//!
//! # Example
//!
//! ```rust,no_run
//! use orrery::{BirthData, ComputeRequest, MeanEphemeris, Orrery};
//!
//! #[tokio::main]
//! async fn main() -> orrery::Result<()> {
//!     let gateway = Orrery::builder()
//!         .calculator(MeanEphemeris::new())
//!         .build()?;
//!
//!     let subject = BirthData::new("Ada", 1815, 12, 10, 12, 0)
//!         .place("London", "GB")
//!         .coordinates(51.5074, -0.1278);
//!
//!     let served = gateway.serve(&ComputeRequest::subject(subject), "client-1").await?;
//!     println!("{:?} in {:?}", served.meta.cache, served.meta.duration);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod cache;
pub mod calc;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod stats;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use admission::{Admission, RateLimitConfig, RateLimitStatus, RateLimiter};
pub use cache::{CacheKey, LocalCacheConfig, SharedCacheConfig, SharedStore, TtlPolicy};
#[cfg(feature = "redis")]
pub use cache::RedisStoreConfig;
pub use calc::{CalculationError, Calculator, MeanEphemeris};
pub use config::Config;
pub use error::{ErrorKind, OrreryError, Result};
pub use executor::{ComputeExecutor, ComputeHandle, ExecutorConfig};
pub use gateway::{ChartGateway, FlightRole, HealthReport, HealthStatus, Orrery, OrreryBuilder, SingleFlight};
pub use stats::StatsSnapshot;

pub use types::{
    BirthData, CacheOutcome, ChartOptions, ComputeRequest, Moment, Operation, Payload,
    ResponseMeta, Served, TransitOptions,
};

/// Crate version.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
