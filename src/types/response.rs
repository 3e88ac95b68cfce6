//! Response types returned by the gateway.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;
use crate::admission::RateLimitStatus;

/// Serialized computation result.
///
/// Immutable and cheap to clone; every cache level and every waiter holds
/// its own handle to the same bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    /// Serialize a JSON value into a payload.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deserialize the payload.
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("len", &self.0.len()).finish()
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Served from the in-process cache.
    L1Hit,
    /// Served from the shared cache.
    L2Hit,
    /// Missed both levels; the calculator ran (possibly for another caller).
    Computed,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1Hit => "l1",
            Self::L2Hit => "l2",
            Self::Computed => "computed",
        }
    }
}

/// Per-request metadata surfaced alongside the payload.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub cache: CacheOutcome,
    /// True when this caller waited on a computation started by another
    /// caller for the same key.
    pub coalesced: bool,
    /// Rate-limit state after this request. `None` when admission control
    /// is disabled.
    pub rate_limit: Option<RateLimitStatus>,
    /// Time spent inside the gateway.
    pub duration: Duration,
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Served {
    pub payload: Payload,
    pub meta: ResponseMeta,
}
