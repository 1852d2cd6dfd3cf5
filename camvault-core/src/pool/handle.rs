use std::sync::{Arc, Mutex};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Terminal result of a job, observable by any number of waiters.
#[derive(Debug, Clone)]
pub enum JobOutcome<T> {
    Completed(T),
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),
    Cancelled,
}

impl<T> JobOutcome<T> {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Done,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

struct HandleShared<T> {
    outcome: Mutex<Option<JobOutcome<T>>>,
    status_tx: watch::Sender<JobStatus>,
}

/// Opaque reference to one scheduled unit of work. Owned by the pool that
/// created it; cloning shares the same underlying job.
pub struct JobHandle<T> {
    id: u64,
    shared: Arc<HandleShared<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<T> JobHandle<T> {
    pub(super) fn new(id: u64) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        Self {
            id,
            shared: Arc::new(HandleShared {
                outcome: Mutex::new(None),
                status_tx,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        *self.shared.status_tx.borrow()
    }

    pub(super) fn mark_running(&self) {
        self.shared.status_tx.send_if_modified(|status| {
            if *status == JobStatus::Pending {
                *status = JobStatus::Running;
                true
            } else {
                false
            }
        });
    }

    /// Record the terminal outcome without waking waiters yet. Returns
    /// false if already settled.
    pub(super) fn store_outcome(&self, outcome: JobOutcome<T>) -> bool {
        let mut slot = self.shared.outcome.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }

    /// Publish the terminal status, waking every waiter.
    pub(super) fn publish_status(&self, status: JobStatus) {
        // send_replace stores the value even with no live receivers.
        self.shared.status_tx.send_replace(status);
    }
}

impl<T: Clone> JobHandle<T> {
    /// Terminal outcome, if the job has settled.
    pub fn outcome(&self) -> Option<JobOutcome<T>> {
        self.shared.outcome.lock().unwrap().clone()
    }

    /// Wait until the job settles and return its outcome.
    pub async fn wait(&self) -> JobOutcome<T> {
        let mut rx = self.shared.status_tx.subscribe();
        if rx.wait_for(|status| status.is_terminal()).await.is_err() {
            return JobOutcome::Cancelled;
        }
        self.outcome().unwrap_or(JobOutcome::Cancelled)
    }
}
