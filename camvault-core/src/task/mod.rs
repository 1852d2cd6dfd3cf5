//! Resumable per-task mode: a directory of JSON descriptors, one per
//! dispatched job, with crash-independent status tracking.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::layout::StorageLayout;
use crate::media::{run_shell, MediaError};
use crate::merge::{MergeEngine, MergeJob};
use crate::plan::Routine;
use crate::pool::{JobError, JobOutcome, PoolError, WorkerPool};
use crate::segment::{SegmentAcquisition, SegmentJob};
use crate::verdict::JobVerdict;

pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("malformed task record {path}: {source}")]
    Malformed {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("task {id} is marked running; run `task fail-running` first")]
    StillRunning { id: String },
    #[error("task {id} is missing required argument `{field}`")]
    MissingArg { id: String, field: &'static str },
    #[error("admission refused: {0}")]
    Pool(#[from] PoolError),
    #[error("batch aborted: {message}")]
    Aborted { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type arguments of a task descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    /// Slot start for download tasks, in the camera's local offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<FixedOffset>>,
    /// Shell command line for export tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// One durable task descriptor (`<id>.json` in the tasks directory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "type")]
    pub kind: Routine,
    #[serde(default)]
    pub args: TaskArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// Store over the tasks directory; the file stem is the task id.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// All task records, sorted by id. A malformed descriptor is an error:
    /// silently skipping it would break the resume contract.
    pub async fn scan(&self) -> TaskResult<Vec<(String, TaskRecord)>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|source| TaskError::Io {
                source,
                path: self.dir.clone(),
            })?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| TaskError::Io {
            source,
            path: self.dir.clone(),
        })? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string())
                else {
                    continue;
                };
                let record = self.load_path(&path).await?;
                records.push((stem, record));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    pub async fn load(&self, id: &str) -> TaskResult<TaskRecord> {
        self.load_path(&self.record_path(id)).await
    }

    async fn load_path(&self, path: &std::path::Path) -> TaskResult<TaskRecord> {
        let bytes = fs::read(path).await.map_err(|source| TaskError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        serde_json::from_slice(&bytes).map_err(|source| TaskError::Malformed {
            source,
            path: path.to_path_buf(),
        })
    }

    pub async fn save(&self, id: &str, record: &TaskRecord) -> TaskResult<()> {
        let path = self.record_path(id);
        let bytes =
            serde_json::to_vec_pretty(record).map_err(|source| TaskError::Malformed {
                source,
                path: path.clone(),
            })?;
        fs::write(&path, bytes)
            .await
            .map_err(|source| TaskError::Io { source, path })
    }

    /// Post-crash maintenance: flip every `running` record to `failed` so
    /// the next scan may restart it.
    pub async fn fail_running(&self) -> TaskResult<usize> {
        let mut invalidated = 0;
        for (id, mut record) in self.scan().await? {
            if record.status == Some(TaskStatus::Running) {
                record.status = Some(TaskStatus::Failed);
                self.save(&id, &record).await?;
                debug!(task_id = %id, "task invalidated");
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRunOptions {
    pub restart_finished: bool,
    pub restart_failed: bool,
    /// Reset attempt counters / overwrite merged output.
    pub force: bool,
    pub workers: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
}

/// Scans the tasks directory and drives every unfinished task of one type
/// through a bounded pool.
pub struct TaskRunner {
    context: AppContext,
    store: TaskStore,
    layout: StorageLayout,
    acquisition: Arc<SegmentAcquisition>,
    merge: Arc<MergeEngine>,
}

impl TaskRunner {
    pub fn new(
        context: AppContext,
        store: TaskStore,
        layout: StorageLayout,
        acquisition: Arc<SegmentAcquisition>,
        merge: Arc<MergeEngine>,
    ) -> Self {
        Self {
            context,
            store,
            layout,
            acquisition,
            merge,
        }
    }

    pub async fn process(&self, kind: Routine, options: TaskRunOptions) -> TaskResult<TaskSummary> {
        let pool: WorkerPool<JobVerdict> = WorkerPool::new(
            self.context.pool_config(options.workers.max(1)),
            self.context.shutdown.clone(),
        );

        if !options.restart_finished {
            info!(kind = %kind, "ignoring finished tasks (use --restart-finished to override)");
        }
        if !options.restart_failed {
            info!(kind = %kind, "ignoring failed tasks (use --restart-failed to override)");
        }

        let records = self.store.scan().await?;
        for (id, record) in records {
            if record.kind != kind {
                continue;
            }
            match record.status {
                Some(TaskStatus::Running) => {
                    pool.close().await;
                    return Err(TaskError::StillRunning { id });
                }
                Some(TaskStatus::Finished) if !options.restart_finished => {
                    debug!(task_id = %id, "skip finished task");
                    continue;
                }
                Some(TaskStatus::Failed) if !options.restart_failed => {
                    debug!(task_id = %id, "skip failed task");
                    continue;
                }
                _ => {}
            }
            if let Err(err) = self.spawn_task(&pool, id, record, options).await {
                pool.close().await;
                return Err(err);
            }
        }

        let handles = pool.handles();
        info!(kind = %kind, count = handles.len(), "waiting for tasks to complete");
        let mut summary = TaskSummary {
            total: handles.len(),
            ..TaskSummary::default()
        };
        {
            let mut pending: FuturesUnordered<_> =
                handles.iter().map(|handle| handle.wait()).collect();
            let mut completed = 0usize;
            while let Some(outcome) = pending.next().await {
                completed += 1;
                match outcome {
                    JobOutcome::Completed(verdict) => {
                        if verdict.is_failure() {
                            summary.failed += 1;
                        } else {
                            summary.finished += 1;
                        }
                    }
                    JobOutcome::Cancelled => summary.failed += 1,
                    JobOutcome::Failed(err) => {
                        warn!(error = %err, "task raised, cancelling remaining tasks");
                        drop(pending);
                        pool.close().await;
                        return Err(TaskError::Aborted {
                            message: err.to_string(),
                        });
                    }
                }
                info!(completed, total = summary.total, "tasks completed");
            }
        }
        Ok(summary)
    }

    async fn spawn_task(
        &self,
        pool: &WorkerPool<JobVerdict>,
        id: String,
        record: TaskRecord,
        options: TaskRunOptions,
    ) -> TaskResult<()> {
        match record.kind {
            Routine::Download => {
                let camera_id = require(&id, record.args.camera_id.clone(), "camera_id")?;
                let start = require(&id, record.args.start_time, "start_time")?;
                let file_name = self.layout.task_segment_file_name(&camera_id, start);
                let job = SegmentJob {
                    camera_id: camera_id.clone(),
                    start,
                    tmp: self.layout.download_tmp_dir(&camera_id).join(&file_name),
                    dst: self.layout.task_camera_dir(&camera_id).join(&file_name),
                    force: options.force,
                };
                debug!(task_id = %id, camera_id = %camera_id, "new download task");
                let engine = self.acquisition.clone();
                let store = self.store.clone();
                pool.spawn(run_task(store, id, record, async move {
                    engine
                        .process(&job)
                        .await
                        .map_err(|err| Box::new(err) as JobError)
                }))
                .await?;
            }
            Routine::Merge => {
                let camera_id = require(&id, record.args.camera_id.clone(), "camera_id")?;
                let job = MergeJob {
                    srcdir: self.layout.task_camera_dir(&camera_id),
                    tmp: self.layout.task_merge_tmp_file(&camera_id),
                    dst: self.layout.task_merged_file(&camera_id),
                    force: options.force,
                };
                debug!(task_id = %id, camera_id = %camera_id, "new merge task");
                let engine = self.merge.clone();
                let store = self.store.clone();
                pool.spawn(run_task(store, id, record, async move {
                    engine
                        .merge_camera_dir(&job)
                        .await
                        .map_err(|err| Box::new(err) as JobError)
                }))
                .await?;
            }
            Routine::Export => {
                let command = require(&id, record.args.command.clone(), "command")?;
                debug!(task_id = %id, command = %command, "new export task");
                let store = self.store.clone();
                pool.spawn(run_task(store, id, record, async move {
                    match run_shell(&command, None).await {
                        Ok(stdout) => {
                            if !stdout.is_empty() {
                                debug!(command = %command, "{}", String::from_utf8_lossy(&stdout));
                            }
                            Ok(JobVerdict::Success)
                        }
                        // A failing command line is a failed task, not a
                        // batch-stopping error.
                        Err(MediaError::CommandFailure { .. }) => Ok(JobVerdict::Failed),
                        Err(err) => Err(Box::new(err) as JobError),
                    }
                }))
                .await?;
            }
        }
        Ok(())
    }
}

fn require<T>(id: &str, value: Option<T>, field: &'static str) -> TaskResult<T> {
    value.ok_or_else(|| TaskError::MissingArg {
        id: id.to_string(),
        field,
    })
}

/// Wrap one task's work with durable status tracking: `running` before the
/// work starts, `finished`/`failed` after, regardless of how it ends.
async fn run_task<F>(
    store: TaskStore,
    id: String,
    mut record: TaskRecord,
    work: F,
) -> Result<JobVerdict, JobError>
where
    F: Future<Output = Result<JobVerdict, JobError>>,
{
    record.status = Some(TaskStatus::Running);
    store
        .save(&id, &record)
        .await
        .map_err(|err| Box::new(err) as JobError)?;

    let result = work.await;
    let status = match &result {
        Ok(verdict) if verdict.is_failure() => TaskStatus::Failed,
        Ok(_) => TaskStatus::Finished,
        Err(_) => TaskStatus::Failed,
    };
    record.status = Some(status);
    if status == TaskStatus::Failed {
        info!(task_id = %id, "task entered status \"failed\"");
    } else {
        debug!(task_id = %id, "task entered status \"finished\"");
    }
    if let Err(save_err) = store.save(&id, &record).await {
        if result.is_ok() {
            return Err(Box::new(save_err) as JobError);
        }
        error!(task_id = %id, error = %save_err, "failed to persist task status");
    }
    result
}
