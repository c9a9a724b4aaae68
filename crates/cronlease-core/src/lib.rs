pub mod config;
pub mod error;

pub use config::{CronleaseConfig, DatabaseConfig, SchedulerSettings, TaskConfig};
pub use error::{CoreError, Result};
