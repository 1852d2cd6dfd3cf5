use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::pool::{JobOutcome, WorkerPool};
use crate::verdict::JobVerdict;

use super::models::{Plan, Routine};
use super::store::SqlitePlanStore;
use super::supervisor::PlanSupervisor;
use super::{PlanError, PlanResult};

/// Which routines a run should process.
#[derive(Debug, Clone, Copy)]
pub struct RoutineSelection {
    pub download: bool,
    pub merge: bool,
    pub export: bool,
}

impl Default for RoutineSelection {
    fn default() -> Self {
        Self {
            download: true,
            merge: false,
            export: false,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub plans_ignored_finished: usize,
    pub plans_processed: usize,
    pub plans_finished: usize,
    pub download_succeeded: usize,
    pub download_failed: usize,
    pub merge_succeeded: usize,
    pub merge_failed: usize,
}

/// Batch entrypoint: drives all unfinished plans of the selected routines
/// through routine-scoped worker pools.
pub struct PlanRunner {
    context: AppContext,
    supervisor: Arc<PlanSupervisor>,
    store: SqlitePlanStore,
}

impl PlanRunner {
    pub fn new(context: AppContext, supervisor: Arc<PlanSupervisor>, store: SqlitePlanStore) -> Self {
        Self {
            context,
            supervisor,
            store,
        }
    }

    pub async fn run_unfinished(&self, select: RoutineSelection) -> PlanResult<RunSummary> {
        let all = self.store.list()?;
        let mut summary = RunSummary::default();
        summary.plans_ignored_finished = all.iter().filter(|record| record.finished).count();
        info!(
            count = summary.plans_ignored_finished,
            "ignoring finished plans"
        );
        let unfinished: Vec<_> = all.into_iter().filter(|record| !record.finished).collect();
        info!(count = unfinished.len(), "plans to process");

        if select.download {
            let plans: Vec<Plan> = unfinished
                .iter()
                .filter(|record| record.routine == Routine::Download)
                .cloned()
                .map(Plan::queued)
                .collect();
            let (succeeded, failed, finished) = self
                .drive_routine(Routine::Download, plans, self.context.config.workers.download)
                .await?;
            summary.download_succeeded = succeeded;
            summary.download_failed = failed;
            summary.plans_finished += finished;
            info!("all download plans finished");
        }

        if select.merge {
            let plans: Vec<Plan> = unfinished
                .iter()
                .filter(|record| record.routine == Routine::Merge)
                .cloned()
                .map(Plan::queued)
                .collect();
            let (succeeded, failed, finished) = self
                .drive_routine(Routine::Merge, plans, self.context.config.workers.merge)
                .await?;
            summary.merge_succeeded = succeeded;
            summary.merge_failed = failed;
            summary.plans_finished += finished;
            info!("all merge plans finished");
        }

        if select.export {
            let pending = unfinished
                .iter()
                .filter(|record| record.routine == Routine::Export)
                .count();
            if pending > 0 {
                warn!(
                    count = pending,
                    "export plans are dispatched via task records and were not run"
                );
            }
        }

        summary.plans_processed = unfinished.len();
        Ok(summary)
    }

    /// Launch every plan of one routine into a shared pool, then watch the
    /// whole job set to completion with periodic progress tallies. A job
    /// error aborts the batch: the pool is closed (cancelling everything
    /// outstanding) and the failure re-raised.
    async fn drive_routine(
        &self,
        routine: Routine,
        plans: Vec<Plan>,
        limit: usize,
    ) -> PlanResult<(usize, usize, usize)> {
        if plans.is_empty() {
            return Ok((0, 0, 0));
        }
        let pool: WorkerPool<JobVerdict> =
            WorkerPool::new(self.context.pool_config(limit), self.context.shutdown.clone());

        let mut watchers = Vec::with_capacity(plans.len());
        for plan in plans {
            match self.supervisor.launch(plan, &pool).await {
                Ok(watcher) => watchers.push(watcher),
                Err(err) => {
                    self.abort(&pool).await;
                    return Err(err);
                }
            }
        }

        let handles = pool.handles();
        info!(
            routine = %routine,
            count = handles.len(),
            "waiting for jobs to complete"
        );
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut completed = 0usize;
        {
            let mut pending: FuturesUnordered<_> =
                handles.iter().map(|handle| handle.wait()).collect();
            while let Some(outcome) = pending.next().await {
                completed += 1;
                match outcome {
                    JobOutcome::Completed(verdict) => {
                        if verdict.is_failure() {
                            failed += 1;
                        } else {
                            succeeded += 1;
                        }
                    }
                    JobOutcome::Cancelled => failed += 1,
                    JobOutcome::Failed(err) => {
                        warn!(
                            routine = %routine,
                            error = %err,
                            "error raised by child job, cancelling all tasks"
                        );
                        drop(pending);
                        self.abort(&pool).await;
                        return Err(PlanError::BatchAborted {
                            message: err.to_string(),
                        });
                    }
                }
                if completed % 1000 == 0 {
                    info!(
                        routine = %routine,
                        completed,
                        total = handles.len(),
                        ok = succeeded,
                        failed,
                        "progress"
                    );
                }
            }
        }

        let mut finished = 0usize;
        for watcher in watchers {
            if let Ok(plan) = watcher.await {
                if plan.record.finished {
                    finished += 1;
                }
            }
        }
        Ok((succeeded, failed, finished))
    }

    async fn abort(&self, pool: &WorkerPool<JobVerdict>) {
        pool.close().await;
        let counters = pool.counters();
        warn!(
            cancelled = counters.cancelled(),
            settled = counters.settled(),
            spawned = counters.spawned(),
            "pool shut down after abort"
        );
    }

    /// Serve mode: consume plans from the inbound control queue until the
    /// channel closes or shutdown fires. The control layer enqueues new
    /// and restarted plans here.
    pub async fn process_queue(
        &self,
        mut queue: mpsc::Receiver<Plan>,
        select: RoutineSelection,
    ) -> PlanResult<()> {
        let download_pool: WorkerPool<JobVerdict> = WorkerPool::new(
            self.context.pool_config(self.context.config.workers.download),
            self.context.shutdown.clone(),
        );
        let merge_pool: WorkerPool<JobVerdict> = WorkerPool::new(
            self.context.pool_config(self.context.config.workers.merge),
            self.context.shutdown.clone(),
        );

        loop {
            tokio::select! {
                _ = self.context.shutdown.cancelled() => break,
                received = queue.recv() => {
                    let Some(plan) = received else { break };
                    match plan.record.routine {
                        Routine::Download if select.download => {
                            self.supervisor.launch(plan, &download_pool).await?;
                        }
                        Routine::Merge if select.merge => {
                            self.supervisor.launch(plan, &merge_pool).await?;
                        }
                        routine => {
                            info!(plan_id = plan.id(), routine = %routine, "ignoring queued plan");
                        }
                    }
                }
            }
        }

        download_pool.close().await;
        merge_pool.close().await;
        Ok(())
    }
}
