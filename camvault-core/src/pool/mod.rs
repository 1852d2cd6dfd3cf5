//! Bounded-admission job pool.
//!
//! Admission is the only backpressure mechanism: `spawn` suspends when the
//! pool is at capacity and returns once the job is admitted. Every handle
//! is retained for the pool's lifetime (bounded by one finite batch), with
//! an optional window cap for very large deployments.

mod handle;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use handle::{JobHandle, JobOutcome, JobStatus};

/// Type-erased error carried by a failed job.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("shutdown in progress, admission refused")]
    ShuttingDown,
}

/// How many settled handles the pool keeps around for aggregate progress
/// counting. `All` is the default memory/simplicity tradeoff; `Window`
/// caps the ledger while the atomic counters stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRetention {
    All,
    Window(usize),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub limit: usize,
    /// Per-job wait on close before the task is hard-aborted.
    pub grace: Duration,
    pub retention: HandleRetention,
}

impl PoolConfig {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            grace: Duration::ZERO,
            retention: HandleRetention::All,
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn retention(mut self, retention: HandleRetention) -> Self {
        self.retention = retention;
        self
    }
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    spawned: AtomicUsize,
    settled: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl PoolCounters {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn settled(&self) -> usize {
        self.settled.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct JobEntry<T> {
    handle: JobHandle<T>,
    join: JoinHandle<()>,
}

struct PoolInner<T> {
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    grace: Duration,
    retention: HandleRetention,
    next_id: AtomicU64,
    counters: Arc<PoolCounters>,
    handles: Mutex<Vec<JobHandle<T>>>,
    jobs: Mutex<Vec<JobEntry<T>>>,
}

/// Bounded-concurrency scheduler for one routine's jobs.
pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> WorkerPool<T> {
    /// `shutdown` is the process-wide stop signal; admission is refused
    /// once it fires, even with capacity available.
    pub fn new(config: PoolConfig, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.limit)),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                shutdown,
                grace: config.grace,
                retention: config.retention,
                next_id: AtomicU64::new(1),
                counters: Arc::new(PoolCounters::default()),
                handles: Mutex::new(Vec::new()),
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Admit one unit of work, suspending while the pool is at capacity.
    /// Returns only once the job is admitted; refuses if the pool closed
    /// or process shutdown began while waiting.
    pub async fn spawn<F>(&self, work: F) -> PoolResult<JobHandle<T>>
    where
        F: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let permit = inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        // Re-check after the suspension: close() or shutdown may have won
        // the race while this caller was waiting for a slot.
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = JobHandle::new(id);
        let shared = handle.clone();
        let cancel = inner.cancel.child_token();
        let counters = inner.counters.clone();
        counters.spawned.fetch_add(1, Ordering::Relaxed);

        let join = tokio::spawn(async move {
            let _permit = permit;
            shared.mark_running();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => JobOutcome::Cancelled,
                result = AssertUnwindSafe(work).catch_unwind() => match result {
                    Ok(Ok(value)) => JobOutcome::Completed(value),
                    Ok(Err(err)) => JobOutcome::Failed(Arc::from(err)),
                    Err(panic) => JobOutcome::Failed(Arc::from(JobError::from(
                        panic_message(panic),
                    ))),
                },
            };
            settle(&shared, outcome, &counters);
        });

        self.retain(handle.clone(), join);
        Ok(handle)
    }

    fn retain(&self, handle: JobHandle<T>, join: JoinHandle<()>) {
        let mut handles = self.inner.handles.lock().unwrap();
        handles.push(handle.clone());
        if let HandleRetention::Window(cap) = self.inner.retention {
            let excess = handles.len().saturating_sub(cap.max(1));
            if excess > 0 {
                handles.drain(..excess);
            }
        }
        drop(handles);
        self.inner.jobs.lock().unwrap().push(JobEntry { handle, join });
    }

    /// Retained handles, oldest first.
    pub fn handles(&self) -> Vec<JobHandle<T>> {
        self.inner.handles.lock().unwrap().clone()
    }

    pub fn counters(&self) -> Arc<PoolCounters> {
        self.inner.counters.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the pool: refuse all further admission (including callers
    /// currently suspended in `spawn`), cancel every outstanding job, wait
    /// the grace period per job concurrently and abort stragglers. Returns
    /// once every handle is settled. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes every spawner suspended on admission with a refusal.
        inner.semaphore.close();
        inner.cancel.cancel();

        let jobs: Vec<JobEntry<T>> = std::mem::take(&mut *inner.jobs.lock().unwrap());
        let outstanding: Vec<JobEntry<T>> = jobs
            .into_iter()
            .filter(|entry| !entry.handle.status().is_terminal())
            .collect();
        if outstanding.is_empty() {
            return;
        }

        warn!(count = outstanding.len(), "closing outstanding jobs");
        let grace = inner.grace;
        let counters = inner.counters.clone();
        join_all(outstanding.into_iter().map(|entry| {
            let counters = counters.clone();
            async move {
                if timeout(grace, entry.handle.wait()).await.is_err() {
                    entry.join.abort();
                }
                // Swallow the cancellation acknowledgement.
                let _ = entry.join.await;
                settle(&entry.handle, JobOutcome::Cancelled, &counters);
            }
        }))
        .await;
        debug!(
            cancelled = inner.counters.cancelled(),
            settled = inner.counters.settled(),
            "pool closed"
        );
    }
}

fn settle<T>(handle: &JobHandle<T>, outcome: JobOutcome<T>, counters: &PoolCounters) {
    let status = outcome.status();
    if !handle.store_outcome(outcome) {
        return;
    }
    counters.settled.fetch_add(1, Ordering::Relaxed);
    match status {
        JobStatus::Failed => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        JobStatus::Cancelled => {
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
    // Counters update before waiters observe the terminal status.
    handle.publish_status(status);
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("job panicked: {message}")
    } else {
        "job panicked".to_string()
    }
}
