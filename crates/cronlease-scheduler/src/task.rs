use async_trait::async_trait;

/// A named, schedulable unit of work.
///
/// # Idempotency
///
/// A firing that overruns the execution timeout is abandoned, not killed: the
/// supervisor stops watching it, releases the lease and may start a retry
/// while the old `execute()` is still running. Implementations must therefore
/// tolerate the same logical work being performed more than once, possibly
/// concurrently.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Unique identity; also the lease resource name.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Cron expression used unless `start_task` supplies an override.
    fn default_schedule(&self) -> &str;

    /// Perform the work. Return an error to count the firing as failed.
    async fn execute(&self) -> anyhow::Result<()>;

    /// Cheap precondition evaluated right before each firing. `false` skips
    /// the firing silently: no retry, no failure.
    async fn can_run(&self) -> bool {
        true
    }

    /// Implementation-specific status merged into the aggregate report.
    async fn status(&self) -> Option<serde_json::Value> {
        None
    }
}
