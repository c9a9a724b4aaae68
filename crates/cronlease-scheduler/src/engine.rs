use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use cronlease_core::SchedulerSettings;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    lock::LockManager,
    schedule::CronSchedule,
    supervisor::{ExecutionAttempt, Supervisor, SupervisorPolicy},
    task::Task,
    trigger::{FireCallback, TokioTriggerDriver, TriggerDriver, TriggerHandle},
    types::{ExecutionOutcome, FireReason, Lease, SchedulerStatus, TaskInfo, TaskStatus},
};

/// Registry entry: the task definition plus its mutable runtime state.
struct RegisteredTask {
    task: Arc<dyn Task>,
    schedule: CronSchedule,
    retry_count: u32,
    trigger: Option<Box<dyn TriggerHandle>>,
    pending_retry: Option<JoinHandle<()>>,
    /// In-process guard: a firing is under supervision.
    executing: bool,
    /// Bumped by start/stop so a firing that straddles them doesn't schedule
    /// a stale retry.
    generation: u64,
    last_outcome: Option<ExecutionOutcome>,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl RegisteredTask {
    fn new(task: Arc<dyn Task>, schedule: CronSchedule) -> Self {
        Self {
            task,
            schedule,
            retry_count: 0,
            trigger: None,
            pending_retry: None,
            executing: false,
            generation: 0,
            last_outcome: None,
            last_run_at: None,
            last_error: None,
        }
    }

    fn is_running(&self) -> bool {
        self.trigger.as_ref().is_some_and(|t| t.is_active())
    }

    /// Stop the recurring trigger and any pending retry.
    fn disarm(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            trigger.stop();
        }
        if let Some(retry) = self.pending_retry.take() {
            retry.abort();
        }
        self.generation += 1;
    }
}

struct Inner {
    supervisor: Supervisor,
    driver: Arc<dyn TriggerDriver>,
    tasks: DashMap<String, RegisteredTask>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Owns the registered tasks, their recurring triggers and retry state.
///
/// Cheap to clone; clones share the same registry. Construct one per process
/// and tear it down with [`Scheduler::shutdown`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Production scheduler: tokio timers and a holder id from `settings`.
    pub fn new(settings: &SchedulerSettings, locks: Arc<LockManager>) -> Self {
        Self::with_driver(
            SupervisorPolicy::from(settings),
            settings.resolve_holder_id(),
            locks,
            Arc::new(TokioTriggerDriver),
        )
    }

    pub fn with_driver(
        policy: SupervisorPolicy,
        holder_id: impl Into<String>,
        locks: Arc<LockManager>,
        driver: Arc<dyn TriggerDriver>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(policy, holder_id, locks, shutdown.clone());
        info!(
            holder = %supervisor.holder_id(),
            distributed_locking = supervisor.policy().distributed_locking,
            "scheduler created"
        );
        Self {
            inner: Arc::new(Inner {
                supervisor,
                driver,
                tasks: DashMap::new(),
                started: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn holder_id(&self) -> &str {
        self.inner.supervisor.holder_id()
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        self.inner.supervisor.policy()
    }

    /// Add a task. Its default schedule is validated first; a name may only be
    /// registered once. If the scheduler is already started the task's
    /// trigger is armed immediately.
    pub fn register_task(&self, task: Arc<dyn Task>) -> Result<()> {
        self.ensure_open()?;
        let name = task.name().to_string();
        let schedule = parse_schedule(task.default_schedule())?;

        match self.inner.tasks.entry(name.clone()) {
            Entry::Occupied(_) => return Err(SchedulerError::DuplicateTask { name }),
            Entry::Vacant(slot) => {
                slot.insert(RegisteredTask::new(task, schedule));
            }
        }
        info!(task = %name, "task registered");

        if self.inner.started.load(Ordering::SeqCst) {
            self.start_task(&name, None)?;
        }
        Ok(())
    }

    /// Arm every registered task and start the lease reaper.
    pub fn start_all(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.started.store(true, Ordering::SeqCst);

        // Collect names first; arming needs a mutable entry per task.
        let names: Vec<String> = self.inner.tasks.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            self.start_task(name, None)?;
        }

        if self.policy().distributed_locking {
            self.inner
                .supervisor
                .locks()
                .start_cleanup_process(self.policy().cleanup_interval);
        }
        info!(count = names.len(), "scheduler started");
        Ok(())
    }

    /// Disarm every task. Running executions are not interrupted.
    pub fn stop_all(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        for mut entry in self.inner.tasks.iter_mut() {
            entry.disarm();
        }
        info!("all task triggers stopped");
    }

    /// (Re)arm one task, optionally replacing its schedule. Resets the retry
    /// counter, so this is also how an auto-disabled task is restarted.
    pub fn start_task(&self, name: &str, schedule: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let new_schedule = schedule.map(parse_schedule).transpose()?;

        let mut entry = self
            .inner
            .tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::TaskNotFound { name: name.to_string() })?;
        entry.disarm();
        if let Some(s) = new_schedule {
            entry.schedule = s;
        }
        entry.retry_count = 0;
        let callback = self.inner.fire_callback(name);
        let trigger = self.inner.driver.arm(name, entry.schedule.clone(), callback);
        info!(
            task = %name,
            schedule = %entry.schedule,
            next_run = ?trigger.next_fire_time(),
            "task trigger armed"
        );
        entry.trigger = Some(trigger);
        Ok(())
    }

    /// Remove the task's timer and pending retry. The registration stays, so
    /// [`Scheduler::start_task`] can bring it back. A running execution is
    /// not interrupted.
    pub fn stop_task(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut entry = self
            .inner
            .tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::TaskNotFound { name: name.to_string() })?;
        entry.disarm();
        info!(task = %name, "task trigger stopped");
        Ok(())
    }

    /// Fire a task right now through the same supervised path as a scheduled
    /// tick, and wait for the outcome.
    pub async fn execute_task_now(&self, name: &str) -> Result<ExecutionOutcome> {
        self.ensure_open()?;
        if !self.inner.tasks.contains_key(name) {
            return Err(SchedulerError::TaskNotFound { name: name.to_string() });
        }
        info!(task = %name, "manual execution requested");
        match self.inner.fire(name, FireReason::Manual).await {
            Some(outcome) => Ok(outcome),
            None if self.inner.shutdown.is_cancelled() => Err(SchedulerError::ShuttingDown),
            None => Err(SchedulerError::TaskNotFound { name: name.to_string() }),
        }
    }

    pub fn get_registered_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .inner
            .tasks
            .iter()
            .map(|e| TaskInfo {
                name: e.key().clone(),
                description: e.task.description().to_string(),
                schedule: e.schedule.expression().to_string(),
            })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Aggregate status, including each task's own status payload.
    pub async fn get_status(&self) -> SchedulerStatus {
        let max_retries = self.policy().max_retries;
        let snapshots: Vec<(TaskStatus, Arc<dyn Task>)> = self
            .inner
            .tasks
            .iter()
            .map(|e| {
                let status = TaskStatus {
                    name: e.key().clone(),
                    description: e.task.description().to_string(),
                    schedule: e.schedule.expression().to_string(),
                    is_running: e.is_running(),
                    next_run: e.trigger.as_ref().and_then(|t| t.next_fire_time()),
                    retry_count: e.retry_count,
                    max_retries,
                    is_executing: e.executing,
                    last_outcome: e.last_outcome,
                    last_run_at: e.last_run_at,
                    last_error: e.last_error.clone(),
                    details: None,
                };
                (status, Arc::clone(&e.task))
            })
            .collect();

        // Task payloads are awaited without holding any registry guard.
        let mut tasks = join_all(snapshots.into_iter().map(|(mut status, task)| async move {
            status.details = task.status().await;
            status
        }))
        .await;
        tasks.sort_by(|a, b| a.name.cmp(&b.name));

        SchedulerStatus {
            holder_id: self.holder_id().to_string(),
            distributed_locking: self.policy().distributed_locking,
            started: self.inner.started.load(Ordering::SeqCst),
            tasks,
        }
    }

    pub fn get_lock_status(&self) -> Result<Vec<Lease>> {
        self.inner.supervisor.locks().get_all_locks()
    }

    pub fn force_release_all_locks(&self) -> Result<usize> {
        self.inner.supervisor.locks().force_release_all_locks()
    }

    /// Tear down: stop timers, retries, watchdogs and heartbeats; release
    /// this holder's leases; stop the reaper. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        info!(holder = %self.holder_id(), "scheduler shutting down");

        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        for mut entry in self.inner.tasks.iter_mut() {
            entry.disarm();
        }
        // Let cancelled heartbeats and watchdogs observe the token.
        tokio::task::yield_now().await;

        let locks = self.inner.supervisor.locks();
        let released = locks.release_all_for_holder(self.holder_id());
        locks.stop_cleanup_process();
        self.inner.tasks.clear();

        let released = released?;
        info!(released, "scheduler shut down");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }
}

impl Inner {
    /// Trigger callback: every tick spawns a supervised firing.
    fn fire_callback(self: &Arc<Self>, name: &str) -> FireCallback {
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        Arc::new(move || {
            let weak = weak.clone();
            let name = name.clone();
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(&name, FireReason::Scheduled).await;
                }
            });
        })
    }

    /// One firing plus retry bookkeeping. `None` if the task is not registered.
    async fn fire(self: &Arc<Self>, name: &str, reason: FireReason) -> Option<ExecutionOutcome> {
        // A tick spawned just before shutdown must not take a fresh lease.
        if self.shutdown.is_cancelled() {
            return None;
        }
        let (task, generation) = {
            let mut entry = self.tasks.get_mut(name)?;
            if reason == FireReason::Retry {
                // This firing is the pending retry; detach its own handle.
                entry.pending_retry = None;
            }
            if entry.executing {
                debug!(task = %name, %reason, "firing skipped: already executing in this process");
                return Some(ExecutionOutcome::SkippedAlreadyRunning);
            }
            entry.executing = true;
            (Arc::clone(&entry.task), entry.generation)
        };
        // Cleared on drop, so a panic inside supervision can't wedge the task.
        let _executing = ExecutingGuard { tasks: &self.tasks, name };

        let attempt = self.supervisor.run(task, reason).await;
        self.record(name, generation, &attempt);
        Some(attempt.outcome)
    }

    fn record(self: &Arc<Self>, name: &str, generation: u64, attempt: &ExecutionAttempt) {
        let Some(mut entry) = self.tasks.get_mut(name) else {
            return;
        };
        entry.last_outcome = Some(attempt.outcome);
        if !attempt.outcome.is_skip() {
            entry.last_run_at = Some(attempt.started_at);
        }
        if self.shutdown.is_cancelled() {
            return;
        }
        if entry.generation != generation {
            // Started before a start_task/stop_task; the counter and trigger
            // now belong to the new arming.
            if attempt.outcome.is_failure() {
                entry.last_error = attempt.error.clone();
            }
            debug!(task = %name, outcome = %attempt.outcome, "stale firing finished; retry state untouched");
            return;
        }

        let max_retries = self.supervisor.policy().max_retries;
        match attempt.outcome {
            ExecutionOutcome::Succeeded => {
                if entry.retry_count > 0 {
                    info!(task = %name, after_retries = entry.retry_count, "task recovered");
                }
                entry.retry_count = 0;
                entry.last_error = None;
            }
            ExecutionOutcome::Failed | ExecutionOutcome::TimedOut => {
                entry.retry_count = (entry.retry_count + 1).min(max_retries);
                entry.last_error = attempt.error.clone();

                if entry.retry_count >= max_retries {
                    error!(
                        task = %name,
                        retries = entry.retry_count,
                        "task disabled after reaching max retries; restart it manually"
                    );
                    entry.disarm();
                } else {
                    let delay = self.supervisor.policy().retry_delay;
                    warn!(
                        task = %name,
                        retry = entry.retry_count,
                        max_retries,
                        delay_secs = delay.as_secs(),
                        "scheduling retry"
                    );
                    let handle = self.spawn_retry(name);
                    if let Some(old) = entry.pending_retry.replace(handle) {
                        old.abort();
                    }
                }
            }
            _ => {}
        }
    }

    fn spawn_retry(self: &Arc<Self>, name: &str) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        let delay = self.supervisor.policy().retry_delay;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
            if let Some(inner) = weak.upgrade() {
                inner.fire(&name, FireReason::Retry).await;
            }
        })
    }
}

struct ExecutingGuard<'a> {
    tasks: &'a DashMap<String, RegisteredTask>,
    name: &'a str,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.tasks.get_mut(self.name) {
            entry.executing = false;
        }
        if std::thread::panicking() {
            error!(task = %self.name, "supervision panicked; in-process guard released");
        }
    }
}

fn parse_schedule(expr: &str) -> Result<CronSchedule> {
    CronSchedule::parse(expr).map_err(|source| SchedulerError::InvalidSchedule {
        expression: expr.to_string(),
        source,
    })
}
