//! Tasks defined in config as shell commands.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronlease_core::TaskConfig;
use cronlease_scheduler::Task;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

/// Stderr kept in a failure message; the tail is what usually explains it.
const MAX_ERROR_CHARS: usize = 2_000;

#[derive(Debug, Default, Clone, Serialize)]
struct RunStats {
    runs: u64,
    last_exit_code: Option<i32>,
    last_duration_ms: Option<u64>,
    last_finished_at: Option<DateTime<Utc>>,
}

/// Runs `command` through `sh -c`. A non-zero exit status is a failure.
///
/// The child is not killed when supervision times out; it keeps running
/// until it exits on its own.
pub struct CommandTask {
    name: String,
    description: String,
    schedule: String,
    command: String,
    precondition: Option<String>,
    working_dir: Option<String>,
    stats: Mutex<RunStats>,
}

impl CommandTask {
    pub fn from_config(cfg: &TaskConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            schedule: cfg.schedule.clone(),
            command: cfg.command.clone(),
            precondition: cfg.precondition.clone(),
            working_dir: cfg.working_dir.clone(),
            stats: Mutex::new(RunStats::default()),
        }
    }

    fn shell(&self, script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn default_schedule(&self) -> &str {
        &self.schedule
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let output = self
            .shell(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to spawn `{}`", self.command))?;

        let exit_code = output.status.code().unwrap_or(-1);
        {
            let mut stats = self.stats.lock().unwrap();
            stats.runs += 1;
            stats.last_exit_code = Some(exit_code);
            stats.last_duration_ms = Some(started.elapsed().as_millis() as u64);
            stats.last_finished_at = Some(Utc::now());
        }
        debug!(
            task = %self.name,
            exit_code,
            stdout_bytes = output.stdout.len(),
            "command finished"
        );

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = tail(stderr.trim(), MAX_ERROR_CHARS);
        if stderr.is_empty() {
            anyhow::bail!("command exited with status {exit_code}");
        }
        anyhow::bail!("command exited with status {exit_code}: {stderr}")
    }

    async fn can_run(&self) -> bool {
        let Some(precondition) = &self.precondition else {
            return true;
        };
        let status = self
            .shell(precondition)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) => s.success(),
            Err(e) => {
                warn!(task = %self.name, "precondition could not be run: {e}");
                false
            }
        }
    }

    async fn status(&self) -> Option<serde_json::Value> {
        let stats = self.stats.lock().unwrap().clone();
        serde_json::to_value(stats).ok()
    }
}

/// Last `max_chars` characters of `s`, split on a char boundary.
fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    match s.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
