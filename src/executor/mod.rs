//! Bounded executor for blocking computations.
//!
//! A fixed set of worker tasks pulls jobs from a bounded queue and runs
//! each one on tokio's blocking pool, so at most `workers` computations
//! occupy a thread at any time and the async runtime never blocks.
//!
//! # Overload
//!
//! [`ComputeExecutor::submit`] never waits for queue space: a full queue
//! fails immediately with [`OrreryError::ExecutorSaturated`]. Callers that
//! want to wait do so explicitly by retrying.
//!
//! # Timeouts
//!
//! [`ComputeHandle::wait`] gives up once the compute budget, measured from
//! submission, has elapsed. A job that is already running keeps running (a
//! blocking thread cannot be interrupted) and its result is discarded. A
//! job still in the queue when its handle goes away is skipped.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::telemetry;
use crate::{OrreryError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor sizing.
///
/// ```rust
/// # use orrery::ExecutorConfig;
/// # use std::time::Duration;
/// let config = ExecutorConfig::new()
///     .workers(8)
///     .queue_capacity(128)
///     .compute_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent computations. Default: 4.
    pub workers: usize,
    /// Jobs that may wait for a worker. Default: 64.
    pub queue_capacity: usize,
    /// Budget per job, from submission to result. Default: 30s.
    pub compute_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            compute_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("executor needs at least one worker".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("executor queue capacity must be non-zero".to_string());
        }
        if self.compute_timeout.is_zero() {
            return Err("compute timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Pending result of a submitted job.
#[must_use = "a compute handle does nothing unless waited on"]
pub struct ComputeHandle<T> {
    rx: oneshot::Receiver<std::thread::Result<T>>,
    deadline: Instant,
    budget: Duration,
}

impl<T> ComputeHandle<T> {
    /// Wait for the job's result.
    ///
    /// # Errors
    ///
    /// - [`OrreryError::ComputeTimeout`] once the budget has elapsed
    /// - [`OrreryError::ComputeFailed`] if the job panicked
    /// - [`OrreryError::ExecutorClosed`] if the job was discarded at shutdown
    pub async fn wait(self) -> Result<T> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Err(_) => Err(OrreryError::ComputeTimeout {
                budget: self.budget,
            }),
            Ok(Err(_)) => Err(OrreryError::ExecutorClosed),
            Ok(Ok(Err(panic))) => Err(OrreryError::ComputeFailed(format!(
                "computation panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

/// Bounded worker pool for blocking computations.
pub struct ComputeExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
    config: ExecutorConfig,
}

impl ComputeExecutor {
    /// Start the workers.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ExecutorConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&rx), Arc::clone(&busy))))
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "compute executor started"
        );

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            busy,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Queue a blocking job.
    ///
    /// Returns immediately. Fails with [`OrreryError::ExecutorSaturated`]
    /// when the queue is full and [`OrreryError::ExecutorClosed`] after
    /// [`shutdown`](Self::shutdown).
    pub fn submit<F, T>(&self, f: F) -> Result<ComputeHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            if tx.is_closed() {
                debug!("compute job abandoned before start, skipping");
                return;
            }
            let outcome = catch_unwind(AssertUnwindSafe(f));
            if let Err(panic) = &outcome {
                warn!(panic = panic_message(panic.as_ref()), "compute job panicked");
            }
            // Receiver gone means the caller timed out or went away.
            let _ = tx.send(outcome);
        });

        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(OrreryError::ExecutorClosed);
        };

        match sender.try_send(job) {
            Ok(()) => {
                metrics::gauge!(telemetry::EXECUTOR_QUEUE_DEPTH).set(queued(sender) as f64);
                let submitted = Instant::now();
                Ok(ComputeHandle {
                    rx,
                    deadline: submitted + self.config.compute_timeout,
                    budget: self.config.compute_timeout,
                })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(telemetry::EXECUTOR_SATURATED_TOTAL).increment(1);
                debug!(capacity = self.config.queue_capacity, "executor queue full");
                Err(OrreryError::ExecutorSaturated {
                    capacity: self.config.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(OrreryError::ExecutorClosed),
        }
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(queued)
            .unwrap_or(0)
    }

    /// Jobs currently running.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, run what is queued and wait for the workers.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers: Vec<_> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.await;
        }
        metrics::gauge!(telemetry::EXECUTOR_QUEUE_DEPTH).set(0.0);
        info!("compute executor stopped");
    }
}

async fn worker_loop(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>, busy: Arc<AtomicUsize>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            let job = rx.recv().await;
            metrics::gauge!(telemetry::EXECUTOR_QUEUE_DEPTH).set(rx.len() as f64);
            job
        };
        let Some(job) = job else {
            debug!(worker = id, "compute worker exiting");
            break;
        };

        busy.fetch_add(1, Ordering::Relaxed);
        let result = tokio::task::spawn_blocking(job).await;
        busy.fetch_sub(1, Ordering::Relaxed);

        if let Err(err) = result {
            warn!(worker = id, error = %err, "compute job aborted");
        }
    }
}

fn queued<T>(sender: &mpsc::Sender<T>) -> usize {
    sender.max_capacity() - sender.capacity()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
