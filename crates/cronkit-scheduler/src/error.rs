use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron / interval expression could not be parsed.
    #[error("Invalid expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// A task with the same name is already registered.
    #[error("Task already registered: {name}")]
    DuplicateTask { name: String },

    /// No task with the given name exists in the registry or the config.
    #[error("Task not found: {name}")]
    TaskNotFound { name: String },

    /// A declarative task definition cannot be turned into a task.
    #[error("Invalid task spec: {0}")]
    InvalidTaskSpec(String),

    /// `start()` was called outside a Tokio runtime.
    #[error("No Tokio runtime available to drive the scheduler")]
    NoRuntime,

    /// A manually triggered execution failed.
    #[error("Execution failed: {0}")]
    Execution(#[from] ExecError),

    #[error(transparent)]
    Config(#[from] cronkit_core::CoreError),
}

impl SchedulerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            SchedulerError::DuplicateTask { .. } => "DUPLICATE_TASK",
            SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SchedulerError::InvalidTaskSpec(_) => "INVALID_TASK_SPEC",
            SchedulerError::NoRuntime => "NO_RUNTIME",
            SchedulerError::Execution(ExecError::OverConcurrencyLimit) => "OVER_CONCURRENCY_LIMIT",
            SchedulerError::Execution(_) => "EXECUTION_FAILED",
            SchedulerError::Config(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Outcome of a failed execution cycle.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The executor's concurrency cap was already reached. Not retried: the
    /// next fire time produces a fresh attempt.
    #[error("over concurrency limit")]
    OverConcurrencyLimit,

    /// The handler returned an error.
    #[error("handler failed: {0:#}")]
    Failed(#[from] anyhow::Error),

    /// The handler panicked; the payload message is preserved.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl ExecError {
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, ExecError::OverConcurrencyLimit)
    }
}
