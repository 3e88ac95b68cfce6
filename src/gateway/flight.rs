//! Single-flight deduplication of concurrent computations.
//!
//! The first caller for a key becomes the leader: its work is spawned as an
//! independent task and an in-flight entry is published. Callers arriving
//! while the entry exists become followers and wait on the same outcome.
//! The entry is removed the moment the work finishes, succeeds or fails or
//! panics, so a later caller always starts fresh (and normally hits the
//! cache the leader filled).
//!
//! # Locking
//!
//! The in-flight map is a sharded `DashMap`. A shard lock is held only to
//! look up or insert an entry; waiting happens on a `watch` channel with
//! no lock held, and unrelated keys never contend.
//!
//! # Cancellation
//!
//! The work belongs to its spawned task, not to the leader. Dropping any
//! caller (leader included) only detaches that caller.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::cache::CacheKey;
use crate::{OrreryError, Result};

/// How a caller took part in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Started the computation.
    Leader,
    /// Joined a computation another caller started.
    Follower,
}

struct Flight<V> {
    rx: watch::Receiver<Option<Result<V>>>,
    waiters: AtomicUsize,
}

type FlightMap<V> = Arc<DashMap<CacheKey, Arc<Flight<V>>>>;

/// Coalesces concurrent work for the same key.
pub struct SingleFlight<V> {
    inflight: FlightMap<V>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the run already in flight.
    ///
    /// `work` is only called by the leader. Every caller receives the same
    /// outcome; a panic in `work` reaches all of them as
    /// [`OrreryError::ComputeFailed`].
    pub async fn run<F, Fut>(&self, key: &CacheKey, work: F) -> (FlightRole, Result<V>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (flight, leader_tx) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let flight = Arc::clone(entry.get());
                flight.waiters.fetch_add(1, Ordering::AcqRel);
                (flight, None)
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                let flight = Arc::new(Flight {
                    rx,
                    waiters: AtomicUsize::new(1),
                });
                entry.insert(Arc::clone(&flight));
                (flight, Some(tx))
            }
        };
        let _waiter = WaiterGuard(Arc::clone(&flight));

        let role = match leader_tx {
            Some(tx) => {
                let fut = work();
                let cleanup = FlightCleanup {
                    inflight: Arc::clone(&self.inflight),
                    key: key.clone(),
                    flight: Arc::clone(&flight),
                };
                tokio::spawn(async move {
                    let outcome = fut.await;
                    drop(cleanup);
                    let _ = tx.send(Some(outcome));
                });
                FlightRole::Leader
            }
            None => FlightRole::Follower,
        };

        let mut rx = flight.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().unwrap_or_else(|| Err(aborted())),
            Err(_) => Err(aborted()),
        };
        (role, outcome)
    }

    /// Keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Callers currently waiting on `key`, leader included.
    pub fn waiters(&self, key: &CacheKey) -> usize {
        self.inflight
            .get(key)
            .map(|flight| flight.waiters.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

fn aborted() -> OrreryError {
    OrreryError::ComputeFailed("computation aborted".to_string())
}

/// Removes the flight's entry when the work ends, including by panic.
struct FlightCleanup<V> {
    inflight: FlightMap<V>,
    key: CacheKey,
    flight: Arc<Flight<V>>,
}

impl<V> Drop for FlightCleanup<V> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.flight));
    }
}

struct WaiterGuard<V>(Arc<Flight<V>>);

impl<V> Drop for WaiterGuard<V> {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}
