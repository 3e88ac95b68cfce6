//! The gateway: admission, caching, deduplication and execution wired
//! together behind [`ChartGateway`].

mod builder;
pub mod flight;
mod service;

pub use builder::{Orrery, OrreryBuilder};
pub use flight::{FlightRole, SingleFlight};
pub use service::{ChartGateway, HealthReport, HealthStatus};
