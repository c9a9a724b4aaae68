use thiserror::Error;

/// Why a cron expression was rejected. The `Display` text is the validator's
/// error string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Cron expression contains invalid characters")]
    InvalidCharacters,

    #[error("Cron expression must have 5 or 6 fields, got {count}")]
    FieldCount { count: usize },

    #[error("Invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors surfaced synchronously to scheduler callers.
///
/// Task execution failures never appear here; they are contained by the
/// supervisor and reported through status.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid schedule '{expression}': {source}")]
    InvalidSchedule {
        expression: String,
        #[source]
        source: ScheduleError,
    },

    #[error("Task already registered: {name}")]
    DuplicateTask { name: String },

    #[error("Task not found: {name}")]
    TaskNotFound { name: String },

    /// Underlying SQLite / rusqlite error from the lease store.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            SchedulerError::DuplicateTask { .. } => "DUPLICATE_TASK",
            SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
