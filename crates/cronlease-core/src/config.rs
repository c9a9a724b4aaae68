use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5 * 60;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 2 * 60;
// Matches the execution timeout so a slow-but-alive holder keeps its lease.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Upper bound for every scheduler duration (one year).
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

/// Top-level config (cronlease.toml + CRONLEASE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronleaseConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Shell-command tasks registered by the daemon at startup.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Supervision tunables shared by every registered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Consecutive failures after which a task's recurring timer is stopped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay before a failed or timed-out firing is retried.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Supervisory deadline for one `execute()` call.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// How often a running task renews its lease.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A lease whose last heartbeat is older than this is considered expired.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Cadence of the background reaper sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// When false, firings skip the lease store entirely (single-instance mode).
    #[serde(default = "bool_true")]
    pub distributed_locking: bool,
    /// Opaque holder identity stamped on leases. Generated when absent.
    #[serde(default)]
    pub holder_id: Option<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            distributed_locking: true,
            holder_id: None,
        }
    }
}

impl SchedulerSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Reject combinations that would break lease liveness or retry bookkeeping.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(CoreError::Config("scheduler.max_retries must be at least 1".into()));
        }
        let durations = [
            ("retry_delay_secs", self.retry_delay_secs),
            ("execution_timeout_secs", self.execution_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(CoreError::Config(format!("scheduler.{name} must be greater than 0")));
        }
        if let Some((name, v)) = durations.iter().find(|(_, v)| *v > MAX_DURATION_SECS) {
            return Err(CoreError::Config(format!(
                "scheduler.{name} ({v}) exceeds the maximum of {MAX_DURATION_SECS}"
            )));
        }
        if self.lock_ttl_secs <= self.heartbeat_interval_secs {
            return Err(CoreError::Config(format!(
                "scheduler.lock_ttl_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.lock_ttl_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    /// The configured holder id, or a fresh `host-pid-random` identity.
    pub fn resolve_holder_id(&self) -> String {
        match &self.holder_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let id = generate_holder_id();
                debug!(holder = %id, "generated holder id");
                id
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on a locked database file before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// A shell-command task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 5- or 6-field cron expression.
    pub schedule: String,
    /// Run via `sh -c`; a non-zero exit status counts as failure.
    pub command: String,
    /// Optional gate command; the firing is skipped unless it exits 0.
    #[serde(default)]
    pub precondition: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronlease/cronlease.db", home)
}

fn generate_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

impl CronleaseConfig {
    /// Load config from a TOML file with CRONLEASE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CRONLEASE_SCHEDULER__MAX_RETRIES=5`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading configuration");

        let config: CronleaseConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONLEASE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronlease/cronlease.toml", home)
}
