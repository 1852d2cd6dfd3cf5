use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::directory::CameraDirectory;
use crate::layout::StorageLayout;
use crate::merge::{MergeEngine, MergeJob};
use crate::pool::{JobError, JobHandle, JobOutcome, WorkerPool};
use crate::segment::{SegmentAcquisition, SegmentJob};
use crate::verdict::JobVerdict;

use super::models::{Plan, Routine};
use super::store::SqlitePlanStore;
use super::{PlanError, PlanResult};

/// Quarter-hour offsets of one slot hour.
const SLOT_MINUTES: [u8; 4] = [0, 15, 30, 45];

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Calendar day the cameras recorded.
    pub capture_date: NaiveDate,
    /// Reset attempt counters on every download plan.
    pub force_download: bool,
    /// Overwrite existing merged files.
    pub force_merge: bool,
}

/// One resolved unit of plan work.
#[derive(Debug, Clone)]
pub enum JobSpec {
    Download(SegmentJob),
    Merge(MergeJob),
}

#[derive(Debug, Default)]
pub struct ResolvedPlan {
    pub jobs: Vec<JobSpec>,
    pub cameras: usize,
}

/// Resolves plans into per-camera jobs, spawns them into the routine's
/// pool and tracks each plan to completion through a dedicated watcher.
pub struct PlanSupervisor {
    store: SqlitePlanStore,
    directory: Arc<CameraDirectory>,
    layout: StorageLayout,
    acquisition: Arc<SegmentAcquisition>,
    merge: Arc<MergeEngine>,
    options: SupervisorOptions,
}

impl PlanSupervisor {
    pub fn new(
        store: SqlitePlanStore,
        directory: Arc<CameraDirectory>,
        layout: StorageLayout,
        acquisition: Arc<SegmentAcquisition>,
        merge: Arc<MergeEngine>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            store,
            directory,
            layout,
            acquisition,
            merge,
            options,
        }
    }

    /// Resolve a plan's unit/hour range against the camera directory. An
    /// unknown region or an empty unit intersection logs a warning and
    /// yields zero jobs; the plan still proceeds to finished.
    pub fn resolve(&self, plan: &Plan) -> ResolvedPlan {
        let record = &plan.record;
        if !self.directory.contains_region(record.region) {
            warn!(
                plan_id = record.id,
                region = record.region,
                "plan has unknown region"
            );
            return ResolvedPlan::default();
        }

        let units =
            self.directory
                .units_in_range(record.region, record.first_unit, record.last_unit);
        if units.is_empty() {
            warn!(
                plan_id = record.id,
                region = record.region,
                first_unit = record.first_unit,
                last_unit = record.last_unit,
                "no such units in region"
            );
        }

        let mut resolved = ResolvedPlan::default();
        for (unit, cameras) in units {
            let Some(timezone) = cameras.timezone() else {
                warn!(
                    plan_id = record.id,
                    unit,
                    offset_minutes = cameras.timezone_offset_minutes,
                    "unit has an invalid timezone offset, skipping"
                );
                continue;
            };
            for (index, camera_id) in cameras.camera_ids.iter().enumerate() {
                let camera_index = index + 1;
                resolved.cameras += 1;
                match record.routine {
                    Routine::Download => {
                        let dstdir = self.layout.camera_dir(
                            record.region,
                            unit,
                            camera_index,
                            camera_id,
                        );
                        let tmpdir = self.layout.download_tmp_dir(camera_id);
                        for hour in record.hour_start..record.hour_end {
                            for minute in SLOT_MINUTES {
                                let Some(start) = self
                                    .options
                                    .capture_date
                                    .and_hms_opt(hour as u32, minute as u32, 0)
                                    .and_then(|naive| {
                                        naive.and_local_timezone(timezone).single()
                                    })
                                else {
                                    warn!(
                                        plan_id = record.id,
                                        hour, minute, "slot does not exist, skipping"
                                    );
                                    continue;
                                };
                                let file_name = self.layout.segment_file_name(
                                    camera_id, hour, minute, record.id,
                                );
                                resolved.jobs.push(JobSpec::Download(SegmentJob {
                                    camera_id: camera_id.clone(),
                                    start,
                                    tmp: tmpdir.join(&file_name),
                                    dst: dstdir.join(&file_name),
                                    force: plan.runtime.force_restart
                                        || self.options.force_download,
                                }));
                            }
                        }
                    }
                    Routine::Merge => {
                        resolved.jobs.push(JobSpec::Merge(MergeJob {
                            srcdir: self.layout.camera_dir(
                                record.region,
                                unit,
                                camera_index,
                                camera_id,
                            ),
                            tmp: self.layout.merge_tmp_file(
                                record.region,
                                unit,
                                camera_index,
                                camera_id,
                            ),
                            dst: self.layout.merged_file(
                                record.region,
                                unit,
                                camera_index,
                                camera_id,
                            ),
                            force: plan.runtime.force_restart || self.options.force_merge,
                        }));
                    }
                    Routine::Export => {}
                }
            }
        }

        if record.routine == Routine::Export {
            warn!(
                plan_id = record.id,
                "export plans carry no camera jobs; dispatch export work as task records"
            );
            resolved.jobs.clear();
        }
        resolved
    }

    /// Mark the plan active, spawn its jobs into the pool (suspending at
    /// the admission limit) and hand it to a watcher task. The returned
    /// handle yields the plan in its terminal state.
    pub async fn launch(
        &self,
        mut plan: Plan,
        pool: &WorkerPool<JobVerdict>,
    ) -> PlanResult<JoinHandle<Plan>> {
        plan.runtime.active = true;
        info!(
            plan_id = plan.id(),
            routine = %plan.record.routine,
            region = plan.record.region,
            first_unit = plan.record.first_unit,
            last_unit = plan.record.last_unit,
            "processing new plan"
        );

        let resolved = self.resolve(&plan);
        info!(
            plan_id = plan.id(),
            cameras = resolved.cameras,
            jobs = resolved.jobs.len(),
            "plan resolved"
        );

        let mut handles = Vec::with_capacity(resolved.jobs.len());
        for spec in resolved.jobs {
            let spawned = match spec {
                JobSpec::Download(job) => {
                    let engine = self.acquisition.clone();
                    pool.spawn(async move {
                        engine
                            .process(&job)
                            .await
                            .map_err(|err| Box::new(err) as JobError)
                    })
                    .await
                }
                JobSpec::Merge(job) => {
                    let engine = self.merge.clone();
                    pool.spawn(async move {
                        engine
                            .merge_camera_dir(&job)
                            .await
                            .map_err(|err| Box::new(err) as JobError)
                    })
                    .await
                }
            };
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(
                        plan_id = plan.id(),
                        error = %err,
                        "admission refused, abandoning plan spawn"
                    );
                    return Err(PlanError::BatchAborted {
                        message: err.to_string(),
                    });
                }
            }
        }

        let store = self.store.clone();
        Ok(tokio::spawn(plan_watch(plan, handles, store)))
    }
}

/// Await every job of one plan with no per-job timeout. The first failure
/// stalls the plan (inactive, not finished, restartable); all-success
/// finishes it and persists the flag.
async fn plan_watch(
    mut plan: Plan,
    handles: Vec<JobHandle<JobVerdict>>,
    store: SqlitePlanStore,
) -> Plan {
    {
        let mut pending: FuturesUnordered<_> = handles.iter().map(|handle| handle.wait()).collect();
        while let Some(outcome) = pending.next().await {
            match outcome {
                JobOutcome::Completed(_) => {}
                JobOutcome::Failed(err) => {
                    plan.runtime.active = false;
                    error!(plan_id = plan.id(), error = %err, "plan failed: child job raised");
                    return plan;
                }
                JobOutcome::Cancelled => {
                    plan.runtime.active = false;
                    warn!(plan_id = plan.id(), "plan cancelled before completion");
                    return plan;
                }
            }
        }
    }

    plan.runtime.active = false;
    plan.record.finished = true;
    if let Err(err) = store.set_finished(plan.id(), true) {
        error!(
            plan_id = plan.id(),
            error = %err,
            "failed to persist finished flag"
        );
    }
    info!(plan_id = plan.id(), "plan finished");
    plan
}
