use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan {plan_id} not found")]
    NotFound { plan_id: i64 },
    #[error("invalid routine: {0}")]
    InvalidRoutine(String),
    #[error("plan store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("batch aborted: {message}")]
    BatchAborted { message: String },
}

pub type PlanResult<T> = std::result::Result<T, PlanError>;
