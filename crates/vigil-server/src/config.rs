use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vigil_notify::channels::email::SmtpSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    /// Public base URL, used for links in notifications.
    #[serde(default = "default_app_url")]
    pub app_url: String,
    /// Solved alert history older than this is purged hourly.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Mail delivery is disabled when absent.
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_status_scan_secs")]
    pub status_scan_secs: u64,
    #[serde(default = "default_repeat_tick_secs")]
    pub repeat_tick_secs: u64,
    #[serde(default = "default_snapshot_poll_secs")]
    pub snapshot_poll_secs: u64,
    #[serde(default = "default_notify_workers")]
    pub notify_workers: usize,
    #[serde(default = "default_notify_queue_capacity")]
    pub notify_queue_capacity: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            status_scan_secs: default_status_scan_secs(),
            repeat_tick_secs: default_repeat_tick_secs(),
            snapshot_poll_secs: default_snapshot_poll_secs(),
            notify_workers: default_notify_workers(),
            notify_queue_capacity: default_notify_queue_capacity(),
        }
    }
}

impl AlertsConfig {
    pub fn status_scan_interval(&self) -> Duration {
        Duration::from_secs(self.status_scan_secs.max(1))
    }

    pub fn repeat_tick_interval(&self) -> Duration {
        Duration::from_secs(self.repeat_tick_secs.max(1))
    }

    pub fn snapshot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_poll_secs.max(1))
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database_file() -> String {
    "vigil.db".to_string()
}

fn default_app_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_history_retention_days() -> u32 {
    30
}

fn default_status_scan_secs() -> u64 {
    15
}

fn default_repeat_tick_secs() -> u64 {
    60
}

fn default_snapshot_poll_secs() -> u64 {
    10
}

fn default_notify_workers() -> usize {
    vigil_notify::queue::DEFAULT_WORKERS
}

fn default_notify_queue_capacity() -> usize {
    vigil_notify::queue::DEFAULT_QUEUE_CAPACITY
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path, e))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }
}
