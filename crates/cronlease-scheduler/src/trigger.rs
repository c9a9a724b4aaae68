//! Recurring-trigger port.
//!
//! The scheduler never sleeps on cron times itself. It asks a [`TriggerDriver`]
//! to arm a trigger for a validated [`CronSchedule`] and gets back a handle it
//! can stop. [`TokioTriggerDriver`] is the production engine;
//! [`ManualTriggerDriver`] fires only when told to.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::schedule::CronSchedule;

/// Invoked on every tick. Must not block; spawn work instead.
pub type FireCallback = Arc<dyn Fn() + Send + Sync>;

pub trait TriggerHandle: Send + Sync {
    /// Cancel future ticks. Idempotent.
    fn stop(&self);
    fn is_active(&self) -> bool;
    fn next_fire_time(&self) -> Option<DateTime<Utc>>;
}

pub trait TriggerDriver: Send + Sync {
    fn arm(&self, task: &str, schedule: CronSchedule, on_fire: FireCallback) -> Box<dyn TriggerHandle>;
}

// ---------------------------------------------------------------------------
// Tokio driver
// ---------------------------------------------------------------------------

/// One tokio task per armed trigger, sleeping until the next wall-clock fire time.
///
/// Missed ticks (e.g. the process was suspended) are not replayed; the loop
/// resumes from the current time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTriggerDriver;

struct TokioTriggerHandle {
    join: JoinHandle<()>,
    stopped: AtomicBool,
    next: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl TriggerDriver for TokioTriggerDriver {
    fn arm(&self, task: &str, schedule: CronSchedule, on_fire: FireCallback) -> Box<dyn TriggerHandle> {
        let next = Arc::new(Mutex::new(schedule.next_after(Utc::now())));
        let next_slot = Arc::clone(&next);
        let task = task.to_string();

        let join = tokio::spawn(async move {
            let mut cursor = Utc::now();
            loop {
                let Some(at) = schedule.next_after(cursor) else {
                    warn!(task = %task, schedule = %schedule, "schedule has no future fire time; trigger idle");
                    *next_slot.lock().unwrap() = None;
                    break;
                };
                *next_slot.lock().unwrap() = Some(at);

                // Sleep in a loop: a timer can wake a little before the wall clock.
                loop {
                    let now = Utc::now();
                    if now >= at {
                        break;
                    }
                    let wait = (at - now).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                }

                debug!(task = %task, fire_time = %at, "trigger fired");
                on_fire();
                cursor = at.max(Utc::now());
            }
        });

        Box::new(TokioTriggerHandle {
            join,
            stopped: AtomicBool::new(false),
            next,
        })
    }
}

impl TriggerHandle for TokioTriggerHandle {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.join.abort();
    }

    fn is_active(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.join.is_finished()
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        if self.is_active() {
            *self.next.lock().unwrap()
        } else {
            None
        }
    }
}

impl Drop for TokioTriggerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

// ---------------------------------------------------------------------------
// Manual driver
// ---------------------------------------------------------------------------

struct ManualTrigger {
    task: String,
    schedule: CronSchedule,
    on_fire: FireCallback,
    active: Arc<AtomicBool>,
}

/// Records armed triggers and fires them on demand. Clones share state.
#[derive(Clone, Default)]
pub struct ManualTriggerDriver {
    armed: Arc<Mutex<Vec<ManualTrigger>>>,
}

struct ManualTriggerHandle {
    schedule: CronSchedule,
    active: Arc<AtomicBool>,
}

impl ManualTriggerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick every active trigger armed for `task`. Returns how many fired.
    pub fn fire(&self, task: &str) -> usize {
        // Collect first: a callback may arm or stop triggers.
        let callbacks: Vec<FireCallback> = {
            let armed = self.armed.lock().unwrap();
            armed
                .iter()
                .filter(|t| t.task == task && t.active.load(Ordering::SeqCst))
                .map(|t| Arc::clone(&t.on_fire))
                .collect()
        };
        for cb in &callbacks {
            cb();
        }
        callbacks.len()
    }

    /// Whether `task` currently has an active trigger.
    pub fn is_armed(&self, task: &str) -> bool {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.task == task && t.active.load(Ordering::SeqCst))
    }

    /// Schedule expression of the active trigger for `task`, if any.
    pub fn armed_schedule(&self, task: &str) -> Option<String> {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.task == task && t.active.load(Ordering::SeqCst))
            .map(|t| t.schedule.expression().to_string())
    }
}

impl TriggerDriver for ManualTriggerDriver {
    fn arm(&self, task: &str, schedule: CronSchedule, on_fire: FireCallback) -> Box<dyn TriggerHandle> {
        let active = Arc::new(AtomicBool::new(true));
        let mut armed = self.armed.lock().unwrap();
        armed.retain(|t| t.active.load(Ordering::SeqCst));
        armed.push(ManualTrigger {
            task: task.to_string(),
            schedule: schedule.clone(),
            on_fire,
            active: Arc::clone(&active),
        });
        Box::new(ManualTriggerHandle { schedule, active })
    }
}

impl TriggerHandle for ManualTriggerHandle {
    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        if self.is_active() {
            self.schedule.next_after(Utc::now())
        } else {
            None
        }
    }
}

impl Drop for ManualTriggerHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
