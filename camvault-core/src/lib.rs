pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod fsutil;
pub mod layout;
pub mod media;
pub mod merge;
pub mod plan;
pub mod pool;
pub mod segment;
pub mod sqlite;
pub mod task;
pub mod verdict;

pub use config::{load_camvault_config, CamvaultConfig};
pub use context::AppContext;
pub use directory::{CameraDirectory, DirectoryEntry, DirectoryError};
pub use error::{ConfigError, Result};
pub use layout::StorageLayout;
pub use media::{
    CommandSegmentFetcher, ConcatPart, Concatenator, FfmpegToolkit, FrameHasher, MediaError,
    MediaProbe, SegmentFetcher,
};
pub use merge::{MergeConfig, MergeEngine, MergeError, MergeJob};
pub use plan::{
    NewPlan, Plan, PlanError, PlanRecord, PlanRunner, PlanSupervisor, Routine, RoutineSelection,
    RunSummary, SqlitePlanStore, SqlitePlanStoreBuilder, SupervisorOptions,
};
pub use pool::{
    HandleRetention, JobHandle, JobOutcome, JobStatus, PoolConfig, PoolError, WorkerPool,
};
pub use segment::{AcquisitionConfig, GapReport, GapSpan, SegmentAcquisition, SegmentError, SegmentJob};
pub use task::{TaskError, TaskRecord, TaskRunOptions, TaskRunner, TaskStatus, TaskStore, TaskSummary};
pub use verdict::JobVerdict;
