use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cronlease_core::CronleaseConfig;
use cronlease_scheduler::{schedule, CronSchedule, ExecutionOutcome, LockManager, Scheduler};
use tracing::{info, warn};

mod command_task;

use command_task::CommandTask;

#[derive(Parser)]
#[command(name = "cronlease")]
#[command(about = "Cron task supervisor with SQLite-backed leases")]
#[command(version)]
struct Cli {
    /// Config file. Falls back to $CRONLEASE_CONFIG, then ~/.cronlease/cronlease.toml
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured tasks until SIGINT/SIGTERM
    Run {
        /// Seconds between aggregate status log lines
        #[arg(long, default_value_t = 300)]
        status_every: u64,
    },
    /// Check a cron expression and show its next fire times
    Validate {
        expression: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Print every lease in the store as JSON
    Locks,
    /// Delete every lease regardless of holder (recovery only)
    ForceRelease,
    /// Print the status of the configured tasks as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronlease_daemon=info,cronlease_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit --config > CRONLEASE_CONFIG env > ~/.cronlease/cronlease.toml
    let config_path = cli.config.or_else(|| std::env::var("CRONLEASE_CONFIG").ok());

    match cli.command {
        Commands::Validate { expression, count } => validate(&expression, count)?,
        Commands::Run { status_every } => {
            let (config, locks) = load(config_path.as_deref())?;
            run(&config, locks, status_every).await?;
        }
        Commands::Locks => {
            let (_, locks) = load(config_path.as_deref())?;
            let leases = locks.get_all_locks()?;
            println!("{}", serde_json::to_string_pretty(&leases)?);
        }
        Commands::ForceRelease => {
            let (_, locks) = load(config_path.as_deref())?;
            let released = locks.force_release_all_locks()?;
            println!("released {released} lease(s)");
        }
        Commands::Status => {
            let (config, locks) = load(config_path.as_deref())?;
            let scheduler = build_scheduler(&config, locks)?;
            let status = scheduler.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

fn load(config_path: Option<&str>) -> anyhow::Result<(CronleaseConfig, Arc<LockManager>)> {
    let config = CronleaseConfig::load(config_path)
        .map_err(|e| anyhow::anyhow!("[{}] failed to load configuration: {e}", e.code()))?;
    let locks = open_lock_store(&config)?;
    Ok((config, locks))
}

fn validate(expression: &str, count: usize) -> anyhow::Result<()> {
    let result = schedule::validate(expression);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.valid {
        anyhow::bail!("invalid cron expression: {expression}");
    }

    let parsed = CronSchedule::parse(expression)?;
    let upcoming = parsed.upcoming(chrono::Utc::now(), count);
    if upcoming.is_empty() {
        println!("no fire time within the search horizon");
    }
    for at in upcoming {
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}

fn open_lock_store(config: &CronleaseConfig) -> anyhow::Result<Arc<LockManager>> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))?;

    let locks = LockManager::new(conn, config.scheduler.lock_ttl())?;
    Ok(Arc::new(locks))
}

fn build_scheduler(config: &CronleaseConfig, locks: Arc<LockManager>) -> anyhow::Result<Scheduler> {
    let scheduler = Scheduler::new(&config.scheduler, locks);
    for task in &config.tasks {
        scheduler
            .register_task(Arc::new(CommandTask::from_config(task)))
            .map_err(|e| anyhow::anyhow!("[{}] cannot register task '{}': {e}", e.code(), task.name))?;
    }
    Ok(scheduler)
}

async fn run(config: &CronleaseConfig, locks: Arc<LockManager>, status_every: u64) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config, locks)?;
    if config.tasks.is_empty() {
        warn!("no tasks configured; the scheduler will idle");
    }
    scheduler.start_all()?;

    let reporter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = scheduler.get_status().await;
                let running = status.tasks.iter().filter(|t| t.is_running).count();
                let executing = status.tasks.iter().filter(|t| t.is_executing).count();
                let failing = status
                    .tasks
                    .iter()
                    .filter(|t| t.last_outcome.is_some_and(ExecutionOutcome::is_failure))
                    .count();
                info!(
                    holder = %status.holder_id,
                    tasks = status.tasks.len(),
                    running,
                    executing,
                    failing,
                    "scheduler status"
                );
            }
        })
    };

    shutdown_signal().await?;
    info!("shutdown signal received");
    reporter.abort();
    scheduler.shutdown().await?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
