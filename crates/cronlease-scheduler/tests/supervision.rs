// End-to-end supervision scenarios against an in-memory lease store, a manual
// trigger driver, and tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::time::Instant;

use cronlease_scheduler::clock::Clock;
use cronlease_scheduler::trigger::ManualTriggerDriver;
use cronlease_scheduler::{
    ExecutionOutcome, LockManager, ScheduleError, Scheduler, SchedulerError, SupervisorPolicy, Task,
};

/// Wall clock that follows tokio's (paused) clock, so lease expiry and
/// heartbeats move together with `tokio::time::sleep`.
struct TokioClock {
    base: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            base: Utc::now(),
            start: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
    }
}

struct ScriptedTask {
    name: String,
    schedule: String,
    fail_first: usize,
    work: Duration,
    gate: bool,
    calls: AtomicUsize,
    finished: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedTask {
    fn new(name: &str, schedule: &str) -> Self {
        Self {
            name: name.to_string(),
            schedule: schedule.to_string(),
            fail_first: 0,
            work: Duration::ZERO,
            gate: true,
            calls: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, first: usize) -> Self {
        self.fail_first = first;
        self
    }

    fn working(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    fn gated_off(mut self) -> Self {
        self.gate = false;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for ScriptedTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test task"
    }

    fn default_schedule(&self) -> &str {
        &self.schedule
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.work).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        if n <= self.fail_first {
            anyhow::bail!("boom");
        }
        Ok(())
    }

    async fn can_run(&self) -> bool {
        self.gate
    }

    async fn status(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "calls": self.calls() }))
    }
}

/// Gate that panics on its first evaluation only.
struct PanicOnceGate {
    gate_calls: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Task for PanicOnceGate {
    fn name(&self) -> &str {
        "fragile"
    }

    fn default_schedule(&self) -> &str {
        "* * * * *"
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn can_run(&self) -> bool {
        if self.gate_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("gate exploded");
        }
        true
    }
}

fn policy() -> SupervisorPolicy {
    SupervisorPolicy {
        max_retries: 3,
        retry_delay: Duration::from_secs(300),
        execution_timeout: Duration::from_secs(1800),
        heartbeat_interval: Duration::from_secs(120),
        cleanup_interval: Duration::from_secs(300),
        distributed_locking: true,
    }
}

fn lock_manager(ttl: Duration) -> Arc<LockManager> {
    let conn = Connection::open_in_memory().unwrap();
    Arc::new(LockManager::with_clock(conn, ttl, Arc::new(TokioClock::new())).unwrap())
}

fn harness(policy: SupervisorPolicy) -> (Scheduler, ManualTriggerDriver, Arc<LockManager>) {
    let locks = lock_manager(Duration::from_secs(1800));
    let driver = ManualTriggerDriver::new();
    let scheduler = Scheduler::with_driver(policy, "node-a", locks.clone(), Arc::new(driver.clone()));
    (scheduler, driver, locks)
}

/// Let spawned firings make progress.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn always_failing_task_is_disabled_after_max_retries() {
    let (scheduler, driver, locks) = harness(policy());
    let task = Arc::new(ScriptedTask::new("flaky", "*/5 * * * *").failing(usize::MAX));
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();
    assert!(driver.is_armed("flaky"));

    assert_eq!(driver.fire("flaky"), 1);
    tokio::time::sleep(Duration::from_secs(1_000)).await;

    // One scheduled firing plus MAX_RETRIES - 1 retries.
    assert_eq!(task.calls(), 3);
    let times = task.call_times.lock().unwrap().clone();
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(300) && gap < Duration::from_secs(301), "gap {gap:?}");
    }

    let status = scheduler.get_status().await;
    let flaky = status.task("flaky").unwrap();
    assert_eq!(flaky.retry_count, 3);
    assert_eq!(flaky.max_retries, 3);
    assert!(!flaky.is_running);
    assert!(flaky.next_run.is_none());
    assert_eq!(flaky.last_outcome, Some(ExecutionOutcome::Failed));
    assert_eq!(flaky.last_error.as_deref(), Some("boom"));
    assert!(!driver.is_armed("flaky"));
    assert!(locks.get_all_locks().unwrap().is_empty());

    // Nothing fires any more.
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(task.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn daily_crawl_recovers_before_exhaustion() {
    let (scheduler, driver, _locks) = harness(policy());
    let task = Arc::new(ScriptedTask::new("daily_crawl", "0 0 * * *").failing(2));
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    driver.fire("daily_crawl");
    tokio::time::sleep(Duration::from_secs(700)).await;

    assert_eq!(task.calls(), 3);
    let status = scheduler.get_status().await;
    let crawl = status.task("daily_crawl").unwrap();
    assert_eq!(crawl.retry_count, 0);
    assert!(crawl.is_running);
    assert!(crawl.next_run.is_some());
    assert_eq!(crawl.last_outcome, Some(ExecutionOutcome::Succeeded));
    assert!(crawl.last_error.is_none());
    assert!(driver.is_armed("daily_crawl"));
}

#[tokio::test(start_paused = true)]
async fn scheduled_firings_reset_counter_on_success() {
    let policy = SupervisorPolicy {
        retry_delay: Duration::from_secs(36_000),
        ..policy()
    };
    let (scheduler, driver, _locks) = harness(policy);
    let task = Arc::new(ScriptedTask::new("daily_crawl", "0 0 * * *").failing(2));
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    for expected in [1, 2] {
        driver.fire("daily_crawl");
        settle().await;
        let status = scheduler.get_status().await;
        assert_eq!(status.task("daily_crawl").unwrap().retry_count, expected);
    }
    driver.fire("daily_crawl");
    settle().await;

    let status = scheduler.get_status().await;
    let crawl = status.task("daily_crawl").unwrap();
    assert_eq!(task.calls(), 3);
    assert_eq!(crawl.retry_count, 0);
    assert!(crawl.is_running);

    // The retry scheduled by the second failure was superseded, not doubled.
    tokio::time::sleep(Duration::from_secs(40_000)).await;
    assert_eq!(task.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn can_run_false_never_executes() {
    let (scheduler, driver, locks) = harness(policy());
    let task = Arc::new(ScriptedTask::new("gated", "* * * * *").gated_off());
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    let outcome = scheduler.execute_task_now("gated").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::SkippedCannotRun);
    driver.fire("gated");
    settle().await;

    assert_eq!(task.calls(), 0);
    let status = scheduler.get_status().await;
    let gated = status.task("gated").unwrap();
    assert_eq!(gated.retry_count, 0);
    assert_eq!(gated.last_outcome, Some(ExecutionOutcome::SkippedCannotRun));
    assert!(gated.last_run_at.is_none());
    assert!(gated.is_running);
    assert!(locks.get_all_locks().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_registration_keeps_first() {
    let (scheduler, _driver, _locks) = harness(policy());
    scheduler
        .register_task(Arc::new(ScriptedTask::new("daily_crawl", "0 0 * * *")))
        .unwrap();

    let err = scheduler
        .register_task(Arc::new(ScriptedTask::new("daily_crawl", "*/5 * * * *")))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateTask { ref name } if name == "daily_crawl"));

    let tasks = scheduler.get_registered_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].schedule, "0 0 * * *");
    assert_eq!(tasks[0].description, "scripted test task");
}

#[tokio::test(start_paused = true)]
async fn invalid_schedule_is_rejected_at_registration() {
    let (scheduler, _driver, _locks) = harness(policy());
    let err = scheduler
        .register_task(Arc::new(ScriptedTask::new("bad", "0 0 * * *; rm -rf /")))
        .unwrap_err();
    match err {
        SchedulerError::InvalidSchedule { source, .. } => {
            assert_eq!(source, ScheduleError::InvalidCharacters)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(scheduler.get_registered_tasks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn foreign_lease_skips_without_retry() {
    let (scheduler, _driver, locks) = harness(policy());
    let task = Arc::new(ScriptedTask::new("job", "* * * * *"));
    scheduler.register_task(task.clone()).unwrap();
    assert!(locks.acquire_lock("job", "node-b").unwrap());

    let outcome = scheduler.execute_task_now("job").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::SkippedNoLock);
    assert_eq!(task.calls(), 0);
    let status = scheduler.get_status().await;
    assert_eq!(status.task("job").unwrap().retry_count, 0);

    tokio::time::sleep(Duration::from_secs(1_000)).await;
    assert_eq!(task.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn two_instances_share_one_store() {
    let locks = lock_manager(Duration::from_secs(1800));
    let driver = ManualTriggerDriver::new();
    let a = Scheduler::with_driver(policy(), "node-a", locks.clone(), Arc::new(driver.clone()));
    let b = Scheduler::with_driver(policy(), "node-b", locks.clone(), Arc::new(driver.clone()));

    let task_a = Arc::new(ScriptedTask::new("report", "0 * * * *").working(Duration::from_secs(60)));
    let task_b = Arc::new(ScriptedTask::new("report", "0 * * * *").working(Duration::from_secs(60)));
    a.register_task(task_a.clone()).unwrap();
    b.register_task(task_b.clone()).unwrap();

    let running = {
        let a = a.clone();
        tokio::spawn(async move { a.execute_task_now("report").await })
    };
    settle().await;

    assert_eq!(b.execute_task_now("report").await.unwrap(), ExecutionOutcome::SkippedNoLock);
    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Succeeded);
    assert_eq!(b.execute_task_now("report").await.unwrap(), ExecutionOutcome::Succeeded);

    assert_eq!(task_a.calls(), 1);
    assert_eq!(task_b.calls(), 1);
    assert!(locks.get_all_locks().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_abandons_but_does_not_kill() {
    let policy = SupervisorPolicy {
        execution_timeout: Duration::from_secs(60),
        retry_delay: Duration::from_secs(36_000),
        ..policy()
    };
    let (scheduler, _driver, locks) = harness(policy);
    let task = Arc::new(ScriptedTask::new("slow", "* * * * *").working(Duration::from_secs(600)));
    scheduler.register_task(task.clone()).unwrap();

    let outcome = scheduler.execute_task_now("slow").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::TimedOut);
    assert!(locks.get_all_locks().unwrap().is_empty());

    let status = scheduler.get_status().await;
    let slow = status.task("slow").unwrap();
    assert_eq!(slow.retry_count, 1);
    assert_eq!(slow.last_outcome, Some(ExecutionOutcome::TimedOut));
    assert!(!slow.is_executing);
    assert_eq!(task.finished.load(Ordering::SeqCst), 0);

    // The abandoned work keeps going and completes on its own.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(task.finished.load(Ordering::SeqCst), 1);
    assert_eq!(task.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_long_run_leased() {
    let policy = SupervisorPolicy {
        heartbeat_interval: Duration::from_secs(60),
        ..policy()
    };
    let locks = lock_manager(Duration::from_secs(180));
    let scheduler = Scheduler::with_driver(
        policy,
        "node-a",
        locks.clone(),
        Arc::new(ManualTriggerDriver::new()),
    );
    let task = Arc::new(ScriptedTask::new("long", "0 * * * *").working(Duration::from_secs(600)));
    scheduler.register_task(task.clone()).unwrap();

    let running = {
        let s = scheduler.clone();
        tokio::spawn(async move { s.execute_task_now("long").await })
    };
    tokio::time::sleep(Duration::from_secs(300)).await;

    // Well past the TTL since acquisition, but heartbeats kept it live.
    assert!(!locks.acquire_lock("long", "node-b").unwrap());
    assert_eq!(locks.cleanup_expired().unwrap(), 0);
    let lease = locks.get_lock("long").unwrap().unwrap();
    assert_eq!(lease.holder_id, "node-a");
    assert!(lease.last_heartbeat_at > lease.acquired_at);

    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Succeeded);
    assert!(locks.get_all_locks().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_lease_lets_execution_finish() {
    let policy = SupervisorPolicy {
        heartbeat_interval: Duration::from_secs(60),
        ..policy()
    };
    let locks = lock_manager(Duration::from_secs(180));
    let scheduler = Scheduler::with_driver(
        policy,
        "node-a",
        locks.clone(),
        Arc::new(ManualTriggerDriver::new()),
    );
    let task = Arc::new(ScriptedTask::new("long", "0 * * * *").working(Duration::from_secs(300)));
    scheduler.register_task(task.clone()).unwrap();

    let running = {
        let s = scheduler.clone();
        tokio::spawn(async move { s.execute_task_now("long").await })
    };
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(locks.force_release_all_locks().unwrap(), 1);
    assert!(locks.acquire_lock("long", "node-b").unwrap());

    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Succeeded);
    assert_eq!(task.finished.load(Ordering::SeqCst), 1);
    // Release is holder-guarded, so the competitor's lease survives.
    assert_eq!(locks.get_lock("long").unwrap().unwrap().holder_id, "node-b");
}

#[tokio::test(start_paused = true)]
async fn in_process_guard_blocks_overlapping_manual_trigger() {
    let policy = SupervisorPolicy {
        distributed_locking: false,
        ..policy()
    };
    let (scheduler, driver, locks) = harness(policy);
    let task = Arc::new(ScriptedTask::new("job", "* * * * *").working(Duration::from_secs(100)));
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    driver.fire("job");
    settle().await;
    assert!(locks.get_all_locks().unwrap().is_empty());
    assert!(scheduler.get_status().await.task("job").unwrap().is_executing);

    let outcome = scheduler.execute_task_now("job").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::SkippedAlreadyRunning);

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(task.calls(), 1);
    let status = scheduler.get_status().await;
    let job = status.task("job").unwrap();
    assert!(!job.is_executing);
    assert_eq!(job.last_outcome, Some(ExecutionOutcome::Succeeded));
    assert!(!status.distributed_locking);
}

#[tokio::test(start_paused = true)]
async fn restart_after_disable_with_new_schedule() {
    let policy = SupervisorPolicy {
        max_retries: 1,
        ..policy()
    };
    let (scheduler, driver, _locks) = harness(policy);
    scheduler
        .register_task(Arc::new(ScriptedTask::new("once", "0 0 * * *").failing(1)))
        .unwrap();
    scheduler.start_all().unwrap();

    assert_eq!(scheduler.execute_task_now("once").await.unwrap(), ExecutionOutcome::Failed);
    let status = scheduler.get_status().await;
    assert!(!status.task("once").unwrap().is_running);
    assert_eq!(status.task("once").unwrap().retry_count, 1);

    let err = scheduler.start_task("once", Some("61 * * * *")).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    assert_eq!(scheduler.get_registered_tasks()[0].schedule, "0 0 * * *");

    scheduler.start_task("once", Some("*/10 * * * *")).unwrap();
    let status = scheduler.get_status().await;
    let once = status.task("once").unwrap();
    assert!(once.is_running);
    assert_eq!(once.retry_count, 0);
    assert_eq!(once.schedule, "*/10 * * * *");
    assert_eq!(driver.armed_schedule("once").as_deref(), Some("*/10 * * * *"));

    assert!(matches!(
        scheduler.start_task("missing", None),
        Err(SchedulerError::TaskNotFound { .. })
    ));
    assert!(matches!(
        scheduler.execute_task_now("missing").await,
        Err(SchedulerError::TaskNotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_task_cancels_pending_retry() {
    let (scheduler, driver, _locks) = harness(policy());
    let task = Arc::new(ScriptedTask::new("job", "* * * * *").failing(usize::MAX));
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    assert_eq!(scheduler.execute_task_now("job").await.unwrap(), ExecutionOutcome::Failed);
    scheduler.stop_task("job").unwrap();
    assert!(!driver.is_armed("job"));

    tokio::time::sleep(Duration::from_secs(1_000)).await;
    assert_eq!(task.calls(), 1);
    let status = scheduler.get_status().await;
    assert_eq!(status.task("job").unwrap().retry_count, 1);
    assert!(!status.task("job").unwrap().is_running);
}

#[tokio::test(start_paused = true)]
async fn late_registration_is_armed_and_reports_details() {
    let (scheduler, driver, _locks) = harness(policy());
    scheduler.start_all().unwrap();
    scheduler
        .register_task(Arc::new(ScriptedTask::new("late", "*/5 * * * *")))
        .unwrap();
    assert!(driver.is_armed("late"));

    scheduler.execute_task_now("late").await.unwrap();
    let status = scheduler.get_status().await;
    assert!(status.started);
    assert_eq!(status.holder_id, "node-a");
    let late = status.task("late").unwrap();
    assert_eq!(late.details, Some(serde_json::json!({ "calls": 1 })));
    assert!(late.last_run_at.is_some());

    scheduler.stop_all();
    assert!(!driver.is_armed("late"));
    assert!(!scheduler.get_status().await.started);
}

#[tokio::test(start_paused = true)]
async fn force_release_returns_count() {
    let (scheduler, _driver, locks) = harness(policy());
    for (name, holder) in [("a", "node-a"), ("b", "node-b"), ("c", "node-c")] {
        assert!(locks.acquire_lock(name, holder).unwrap());
    }
    assert_eq!(scheduler.get_lock_status().unwrap().len(), 3);
    assert_eq!(scheduler.force_release_all_locks().unwrap(), 3);
    assert!(scheduler.get_lock_status().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_own_leases_and_stops_reaper() {
    let (scheduler, driver, locks) = harness(policy());
    let task = Arc::new(ScriptedTask::new("long", "* * * * *").working(Duration::from_secs(600)));
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();
    assert!(locks.is_cleanup_running());
    assert!(locks.acquire_lock("foreign", "node-b").unwrap());

    let running = {
        let s = scheduler.clone();
        tokio::spawn(async move { s.execute_task_now("long").await })
    };
    settle().await;
    assert_eq!(scheduler.get_lock_status().unwrap().len(), 2);

    scheduler.shutdown().await.unwrap();

    let leases = locks.get_all_locks().unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].holder_id, "node-b");
    assert!(!locks.is_cleanup_running());
    assert!(!driver.is_armed("long"));
    assert!(scheduler.get_status().await.tasks.is_empty());

    // The in-flight supervision was abandoned, not awaited to completion.
    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Abandoned);

    assert!(matches!(
        scheduler.register_task(Arc::new(ScriptedTask::new("new", "* * * * *"))),
        Err(SchedulerError::ShuttingDown)
    ));
    assert!(matches!(
        scheduler.execute_task_now("long").await,
        Err(SchedulerError::ShuttingDown)
    ));
    assert!(matches!(scheduler.stop_task("long"), Err(SchedulerError::ShuttingDown)));
    assert!(matches!(scheduler.start_all(), Err(SchedulerError::ShuttingDown)));
    scheduler.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn restart_during_failing_run_is_not_undone() {
    let policy = SupervisorPolicy {
        max_retries: 1,
        ..policy()
    };
    let (scheduler, driver, _locks) = harness(policy);
    let task = Arc::new(
        ScriptedTask::new("job", "0 0 * * *")
            .failing(1)
            .working(Duration::from_secs(60)),
    );
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    let running = {
        let s = scheduler.clone();
        tokio::spawn(async move { s.execute_task_now("job").await })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;
    scheduler.start_task("job", Some("*/10 * * * *")).unwrap();

    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Failed);

    let status = scheduler.get_status().await;
    let job = status.task("job").unwrap();
    assert!(job.is_running);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.last_outcome, Some(ExecutionOutcome::Failed));
    assert_eq!(job.last_error.as_deref(), Some("boom"));
    assert_eq!(driver.armed_schedule("job").as_deref(), Some("*/10 * * * *"));
}

#[tokio::test(start_paused = true)]
async fn failure_after_stop_schedules_no_retry() {
    let (scheduler, driver, _locks) = harness(policy());
    let task = Arc::new(
        ScriptedTask::new("job", "0 0 * * *")
            .failing(usize::MAX)
            .working(Duration::from_secs(60)),
    );
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    let running = {
        let s = scheduler.clone();
        tokio::spawn(async move { s.execute_task_now("job").await })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;
    scheduler.stop_task("job").unwrap();
    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Failed);

    tokio::time::sleep(Duration::from_secs(1_000)).await;
    assert_eq!(task.calls(), 1);
    let status = scheduler.get_status().await;
    assert_eq!(status.task("job").unwrap().retry_count, 0);
    assert!(!driver.is_armed("job"));
}

#[tokio::test(start_paused = true)]
async fn panic_in_supervision_releases_in_process_guard() {
    // A lease taken before the panic is left to expire; only the
    // in-process guard is under test here.
    let policy = SupervisorPolicy {
        distributed_locking: false,
        ..policy()
    };
    let (scheduler, driver, _locks) = harness(policy);
    let task = Arc::new(PanicOnceGate {
        gate_calls: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    scheduler.register_task(task.clone()).unwrap();
    scheduler.start_all().unwrap();

    // The panic is confined to the spawned firing.
    driver.fire("fragile");
    settle().await;

    let status = scheduler.get_status().await;
    let fragile = status.task("fragile").unwrap();
    assert!(!fragile.is_executing);
    assert!(fragile.last_outcome.is_none());

    assert_eq!(scheduler.execute_task_now("fragile").await.unwrap(), ExecutionOutcome::Succeeded);
    assert_eq!(task.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn shared_holder_id_still_excludes() {
    let locks = lock_manager(Duration::from_secs(1800));
    let driver = ManualTriggerDriver::new();
    let a = Scheduler::with_driver(policy(), "worker-1", locks.clone(), Arc::new(driver.clone()));
    let b = Scheduler::with_driver(policy(), "worker-1", locks.clone(), Arc::new(driver.clone()));

    let task_a = Arc::new(ScriptedTask::new("report", "0 * * * *").working(Duration::from_secs(60)));
    let task_b = Arc::new(ScriptedTask::new("report", "0 * * * *"));
    a.register_task(task_a.clone()).unwrap();
    b.register_task(task_b.clone()).unwrap();

    let running = {
        let a = a.clone();
        tokio::spawn(async move { a.execute_task_now("report").await })
    };
    settle().await;

    assert_eq!(b.execute_task_now("report").await.unwrap(), ExecutionOutcome::SkippedNoLock);
    assert_eq!(task_b.calls(), 0);
    assert_eq!(running.await.unwrap().unwrap(), ExecutionOutcome::Succeeded);
}
