//! `cronlease-scheduler`: distributed cron supervision.
//!
//! # Overview
//!
//! Tasks are registered with a [`Scheduler`], which validates their cron
//! schedules and arms a recurring trigger for each. Every firing goes through
//! the [`supervisor::Supervisor`]:
//!
//! 1. acquire the task's lease from the shared [`LockManager`] (skip the cycle
//!    if another process holds it),
//! 2. check the task's `can_run()` gate,
//! 3. run `execute()` under a timeout watchdog while a heartbeat renews the lease,
//! 4. release the lease, then reset or bump the task's retry counter.
//!
//! Failures are retried after a fixed delay; reaching the retry limit disarms
//! the task until it is restarted. Timeouts abandon supervision but never kill
//! the work, so task bodies must be idempotent.
//!
//! # Lease table
//!
//! | Column           | Meaning                                  |
//! |------------------|------------------------------------------|
//! | `resource_name`  | Task name (primary key)                  |
//! | `holder_id`      | Opaque id of the owning process          |
//! | `acquired_at`    | Unix ms of the winning acquire           |
//! | `last_heartbeat` | Unix ms; expiry is `last_heartbeat + TTL`|

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod schedule;
pub mod supervisor;
pub mod task;
pub mod trigger;
pub mod types;

pub use engine::Scheduler;
pub use error::{Result, ScheduleError, SchedulerError};
pub use lock::LockManager;
pub use schedule::{validate, CronSchedule, ValidationResult};
pub use supervisor::{ExecutionAttempt, SupervisorPolicy};
pub use task::Task;
pub use types::{ExecutionOutcome, FireReason, Lease, SchedulerStatus, TaskInfo, TaskStatus};
