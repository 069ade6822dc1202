use uuid::Uuid;

use crate::models::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("tool exited with code {exit_code:?}: {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("failed to run tool: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("tool not registered: {0}")]
    ToolNotRegistered(String),
    #[error("runner execution failed: {0}")]
    RunnerExecutionFailed(#[from] RunnerError),
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    #[error("job {0} has no scan consent")]
    ConsentRequired(Uuid),
    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => EngineError::JobNotFound(id),
            other => EngineError::Store(other),
        }
    }
}
