pub mod error;
pub mod models;
pub mod runner;
pub mod store;
pub mod supervisor;

pub use error::{PlanError, PlanResult};
pub use models::{NewPlan, Plan, PlanRecord, PlanRuntime, Routine};
pub use runner::{PlanRunner, RoutineSelection, RunSummary};
pub use store::{SqlitePlanStore, SqlitePlanStoreBuilder};
pub use supervisor::{JobSpec, PlanSupervisor, ResolvedPlan, SupervisorOptions};
