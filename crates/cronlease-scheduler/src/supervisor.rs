//! One supervised firing: lease, gate, heartbeat, watchdog, release.
//!
//! Retry and disable bookkeeping lives in the engine; the supervisor only
//! reports what happened to a single attempt.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronlease_core::SchedulerSettings;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    lock::LockManager,
    task::Task,
    types::{ExecutionOutcome, FireReason},
};

/// Tunables applied to every firing.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub execution_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    pub distributed_locking: bool,
}

impl From<&SchedulerSettings> for SupervisorPolicy {
    fn from(s: &SchedulerSettings) -> Self {
        Self {
            max_retries: s.max_retries,
            retry_delay: s.retry_delay(),
            execution_timeout: s.execution_timeout(),
            heartbeat_interval: s.heartbeat_interval(),
            cleanup_interval: s.cleanup_interval(),
            distributed_locking: s.distributed_locking,
        }
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

/// Record of one firing.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub task: String,
    pub reason: FireReason,
    pub started_at: DateTime<Utc>,
    /// When the watchdog gives up on `execute()`.
    pub deadline: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub lock_held: bool,
    /// A heartbeat found the lease gone while `execute()` was still running.
    pub lease_lost: bool,
    pub outcome: ExecutionOutcome,
    pub error: Option<String>,
}

pub struct Supervisor {
    policy: SupervisorPolicy,
    holder_id: String,
    locks: Arc<LockManager>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        policy: SupervisorPolicy,
        holder_id: impl Into<String>,
        locks: Arc<LockManager>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            policy,
            holder_id: holder_id.into(),
            locks,
            shutdown,
        }
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Drive one firing of `task` to a terminal outcome.
    ///
    /// Never returns an error: store failures during acquisition are treated
    /// as "no lock this cycle", and `execute()` errors become `Failed`.
    pub async fn run(&self, task: Arc<dyn Task>, reason: FireReason) -> ExecutionAttempt {
        let name = task.name().to_string();
        let started_at = Utc::now();
        let timeout = self.policy.execution_timeout;
        let mut attempt = ExecutionAttempt {
            task: name.clone(),
            reason,
            started_at,
            deadline: chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|t| started_at.checked_add_signed(t))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            finished_at: started_at,
            lock_held: false,
            lease_lost: false,
            outcome: ExecutionOutcome::SkippedNoLock,
            error: None,
        };

        if self.policy.distributed_locking {
            match self.locks.acquire_lock(&name, &self.holder_id) {
                Ok(true) => attempt.lock_held = true,
                Ok(false) => {
                    debug!(task = %name, %reason, "lease held elsewhere; skipping this cycle");
                    return finish(attempt, ExecutionOutcome::SkippedNoLock, None);
                }
                Err(e) => {
                    error!(task = %name, "lease acquisition failed: {e}");
                    return finish(attempt, ExecutionOutcome::SkippedNoLock, Some(e.to_string()));
                }
            }
        }

        if !task.can_run().await {
            debug!(task = %name, %reason, "can_run() returned false; skipping");
            self.release(&name, attempt.lock_held);
            return finish(attempt, ExecutionOutcome::SkippedCannotRun, None);
        }

        info!(task = %name, %reason, lock_held = attempt.lock_held, "task execution started");

        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = attempt
            .lock_held
            .then(|| self.spawn_heartbeat(name.clone(), Arc::clone(&lease_lost)));

        // Run on its own task so the watchdog can walk away without cancelling it.
        let work = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.execute().await })
        };

        let (outcome, error) = tokio::select! {
            res = tokio::time::timeout(timeout, work) => match res {
                Ok(Ok(Ok(()))) => (ExecutionOutcome::Succeeded, None),
                Ok(Ok(Err(e))) => (ExecutionOutcome::Failed, Some(format!("{e:#}"))),
                Ok(Err(join_err)) => (
                    ExecutionOutcome::Failed,
                    Some(format!("task panicked: {join_err}")),
                ),
                Err(_elapsed) => (
                    ExecutionOutcome::TimedOut,
                    Some(format!("execution exceeded {}s; abandoned", timeout.as_secs())),
                ),
            },
            _ = self.shutdown.cancelled() => (
                ExecutionOutcome::Abandoned,
                Some("supervision abandoned: scheduler shutting down".to_string()),
            ),
        };

        if let Some(hb) = heartbeat {
            hb.abort();
        }
        self.release(&name, attempt.lock_held);
        attempt.lease_lost = lease_lost.load(Ordering::SeqCst);

        match outcome {
            ExecutionOutcome::Succeeded => info!(task = %name, "task execution succeeded"),
            ExecutionOutcome::TimedOut => warn!(
                task = %name,
                timeout_secs = timeout.as_secs(),
                "task execution timed out; the running work is left to finish on its own"
            ),
            ExecutionOutcome::Abandoned => {
                info!(task = %name, "scheduler shutting down; in-flight work left to finish on its own")
            }
            _ => warn!(task = %name, error = ?error, "task execution failed"),
        }
        finish(attempt, outcome, error)
    }

    fn release(&self, name: &str, held: bool) {
        if !held {
            return;
        }
        if let Err(e) = self.locks.release_lock(name, &self.holder_id) {
            // The reaper reclaims it after the TTL.
            error!(task = %name, "lease release failed: {e}");
        }
    }

    /// Renew the lease every `heartbeat_interval` until aborted, shut down,
    /// or the lease turns out to be gone.
    fn spawn_heartbeat(&self, name: String, lease_lost: Arc<AtomicBool>) -> JoinHandle<()> {
        let locks = Arc::clone(&self.locks);
        let holder = self.holder_id.clone();
        let every = self.policy.heartbeat_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                match locks.update_heartbeat(&name, &holder) {
                    Ok(true) => debug!(task = %name, "lease heartbeat renewed"),
                    Ok(false) => {
                        lease_lost.store(true, Ordering::SeqCst);
                        warn!(task = %name, "lease lost mid-execution; heartbeat stopped, execution continues");
                        break;
                    }
                    // Transient store trouble: try again next tick.
                    Err(e) => warn!(task = %name, "lease heartbeat failed: {e}"),
                }
            }
        })
    }
}

fn finish(
    mut attempt: ExecutionAttempt,
    outcome: ExecutionOutcome,
    error: Option<String>,
) -> ExecutionAttempt {
    attempt.outcome = outcome;
    attempt.error = error;
    attempt.finished_at = Utc::now();
    attempt
}
