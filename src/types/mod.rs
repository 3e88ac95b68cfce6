//! Public types for the Orrery API.

mod request;
mod response;

pub use request::{BirthData, ChartOptions, ComputeRequest, Moment, Operation, TransitOptions};
pub use response::{CacheOutcome, Payload, ResponseMeta, Served};
