use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded exclusive claim on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_name: String,
    /// Opaque identity of the owning process.
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// `last_heartbeat_at + TTL`.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Why a supervised firing started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireReason {
    /// The recurring cron trigger ticked.
    Scheduled,
    /// A bounded retry after a failure or timeout.
    Retry,
    /// `execute_task_now`.
    Manual,
}

impl std::fmt::Display for FireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FireReason::Scheduled => "scheduled",
            FireReason::Retry => "retry",
            FireReason::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Terminal state of one supervised firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOutcome {
    Succeeded,
    /// `execute()` returned an error (or panicked).
    Failed,
    /// The supervisory deadline passed first. The work itself may still be running.
    TimedOut,
    /// Supervision stopped because the scheduler shut down mid-run. Never retried.
    Abandoned,
    /// Another holder owns the lease for this cycle.
    SkippedNoLock,
    /// The task's `can_run()` gate returned false.
    SkippedCannotRun,
    /// A firing of the same task is already under supervision in this process.
    SkippedAlreadyRunning,
}

impl ExecutionOutcome {
    /// Failures and timeouts feed the retry counter; skips never do.
    pub fn is_failure(self) -> bool {
        matches!(self, ExecutionOutcome::Failed | ExecutionOutcome::TimedOut)
    }

    pub fn is_skip(self) -> bool {
        matches!(
            self,
            ExecutionOutcome::SkippedNoLock
                | ExecutionOutcome::SkippedCannotRun
                | ExecutionOutcome::SkippedAlreadyRunning
        )
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionOutcome::Succeeded => "succeeded",
            ExecutionOutcome::Failed => "failed",
            ExecutionOutcome::TimedOut => "timed-out",
            ExecutionOutcome::Abandoned => "abandoned",
            ExecutionOutcome::SkippedNoLock => "skipped-no-lock",
            ExecutionOutcome::SkippedCannotRun => "skipped-cannot-run",
            ExecutionOutcome::SkippedAlreadyRunning => "skipped-already-running",
        };
        write!(f, "{s}")
    }
}

/// Static description of a registered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub description: String,
    /// Currently active schedule (may differ from the task's default after
    /// `start_task` with an override).
    pub schedule: String,
}

/// Per-task runtime snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub description: String,
    pub schedule: String,
    /// The recurring timer is armed.
    pub is_running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// A firing is under supervision right now.
    pub is_executing: bool,
    pub last_outcome: Option<ExecutionOutcome>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// The task's own status payload, if it provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Aggregate status across every registered task.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub holder_id: String,
    pub distributed_locking: bool,
    pub started: bool,
    pub tasks: Vec<TaskStatus>,
}

impl SchedulerStatus {
    pub fn task(&self, name: &str) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
