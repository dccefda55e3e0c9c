use thiserror::Error;

/// Error taxonomy for the execution core.
///
/// Task-level failures are contained as failed `TaskResult`s and never
/// surface as errors, except under the `all` join strategy where the first
/// failure aborts the group. Store read failures are downgraded to "absent"
/// by the store itself and never appear here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no valid tasks in batch")]
    NoValidTasks,

    #[error("executor failed for task {task_id}: {message}")]
    Executor { task_id: String, message: String },

    #[error("task {0} was cancelled")]
    Cancelled(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
