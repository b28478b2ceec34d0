//! `tasklane.toml` loading.
//!
//! Only per-process settings live here. Knobs every process must agree on
//! (pool size, intervals, lease duration) are in the `orchestrator_state` row.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tasklane_core::{TasklaneError, TasklaneResult};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TasklaneConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Default for TasklaneConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: DatabaseConfig::default(),
            sync: SyncConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    /// Defaults to `<data_dir>/tasklane.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SyncConfig {
    /// Defaults to `<data_dir>/tasks.jsonl`.
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconcileConfig {
    /// Heartbeat age after which a worker is declared dead.
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_threshold_seconds: default_stale_threshold_seconds(),
        }
    }
}

/// One hundred years.
const MAX_STALE_THRESHOLD_SECONDS: i64 = 100 * 366 * 24 * 60 * 60;

fn default_data_dir() -> PathBuf {
    PathBuf::from("./.tasklane")
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_stale_threshold_seconds() -> i64 {
    tasklane_orchestrator::DEFAULT_STALE_THRESHOLD_SECONDS
}

impl TasklaneConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tasklane.db"))
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.sync
            .jsonl_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tasks.jsonl"))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile.stale_threshold_seconds)
    }

    fn validate(&self) -> TasklaneResult<()> {
        let threshold = self.reconcile.stale_threshold_seconds;
        if threshold <= 0 || threshold > MAX_STALE_THRESHOLD_SECONDS {
            return Err(TasklaneError::Config(format!(
                "reconcile.stale_threshold_seconds must be between 1 and \
                 {MAX_STALE_THRESHOLD_SECONDS}, got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Read `path`. A missing file yields the defaults; a malformed one is an error.
pub fn load_config(path: &Path) -> TasklaneResult<TasklaneConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(TasklaneConfig::default());
        }
        Err(e) => {
            return Err(TasklaneError::Config(format!(
                "Failed to read config {}: {e}",
                path.display()
            )))
        }
    };
    let config: TasklaneConfig = toml::from_str(&contents).map_err(|e| {
        TasklaneError::Config(format!("Failed to parse config {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}
