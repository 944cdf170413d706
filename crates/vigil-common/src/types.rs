use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root filesystem key. Its usage lives in the snapshot's top-level disk fields.
pub const ROOT_FILESYSTEM: &str = "root";

/// A user-configured alert bound to one monitored system.
///
/// At most one rule exists per `(user_id, system_id, name, filesystem)`.
/// The engine only ever writes `triggered`, `repeat_count` and `last_sent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub user_id: String,
    pub system_id: String,
    /// Metric name, e.g. `"CPU"` or `"Status"`.
    pub name: String,
    /// Disk rules may be scoped to one filesystem. `None` on a Disk rule means
    /// "any filesystem".
    #[serde(default)]
    pub filesystem: Option<String>,
    pub threshold: f64,
    pub min_duration_minutes: u32,
    #[serde(default)]
    pub triggered: bool,
    /// Minutes between repeat notifications, 0 disables repeats.
    #[serde(default)]
    pub repeat_interval_minutes: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_repeats: u32,
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default)]
    pub last_sent: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    /// Clears the repeat bookkeeping after a trigger or clear transition.
    pub fn reset_repeats(&mut self) {
        self.repeat_count = 0;
        self.last_sent = None;
    }
}

/// Used and total bytes of one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FsUsage {
    pub disk_used: f64,
    pub disk_total: f64,
}

impl FsUsage {
    /// Used ratio in percent, `None` when the total is unknown.
    pub fn used_pct(&self) -> Option<f64> {
        (self.disk_total > 0.0).then(|| self.disk_used / self.disk_total * 100.0)
    }
}

/// One system's readings at one collection interval.
///
/// Every metric field is optional so missing data is never mistaken for 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub system_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem_pct: Option<f64>,
    #[serde(default)]
    pub disk_used: Option<f64>,
    #[serde(default)]
    pub disk_total: Option<f64>,
    #[serde(default)]
    pub extra_fs: BTreeMap<String, FsUsage>,
    /// MB/s sent.
    #[serde(default)]
    pub bandwidth_up: Option<f64>,
    /// MB/s received.
    #[serde(default)]
    pub bandwidth_down: Option<f64>,
    #[serde(default)]
    pub temperatures: BTreeMap<String, f64>,
    #[serde(default)]
    pub load_avg: Option<[f64; 3]>,
    #[serde(default)]
    pub swap_pct: Option<f64>,
    #[serde(default)]
    pub swap_used: Option<f64>,
}

impl MetricSnapshot {
    /// Root filesystem usage in percent.
    pub fn root_disk_pct(&self) -> Option<f64> {
        match (self.disk_used, self.disk_total) {
            (Some(disk_used), Some(disk_total)) => FsUsage {
                disk_used,
                disk_total,
            }
            .used_pct(),
            _ => None,
        }
    }

    /// Usage of a named filesystem; `"root"` maps to the top-level fields.
    pub fn filesystem_pct(&self, name: &str) -> Option<f64> {
        if name == ROOT_FILESYSTEM {
            return self.root_disk_pct();
        }
        self.extra_fs.get(name).and_then(FsUsage::used_pct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Up,
    Down,
    Paused,
    Pending,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Up => write!(f, "up"),
            SystemStatus::Down => write!(f, "down"),
            SystemStatus::Paused => write!(f, "paused"),
            SystemStatus::Pending => write!(f, "pending"),
        }
    }
}

impl std::str::FromStr for SystemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(SystemStatus::Up),
            "down" => Ok(SystemStatus::Down),
            "paused" => Ok(SystemStatus::Paused),
            "pending" => Ok(SystemStatus::Pending),
            _ => Err(format!("unknown system status: {s}")),
        }
    }
}

/// A monitored host and the users allowed to manage its alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub id: String,
    pub name: String,
    pub users: Vec<String>,
    pub status: SystemStatus,
}

impl SystemRecord {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryState {
    Active,
    Solved,
}

impl std::fmt::Display for HistoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryState::Active => write!(f, "active"),
            HistoryState::Solved => write!(f, "solved"),
        }
    }
}

impl std::str::FromStr for HistoryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(HistoryState::Active),
            "solved" => Ok(HistoryState::Solved),
            _ => Err(format!("unknown history state: {s}")),
        }
    }
}

/// Audit record of one trigger/clear cycle of an alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertHistoryEntry {
    pub id: String,
    pub alert_id: String,
    pub user_id: String,
    pub system_id: String,
    pub name: String,
    pub value: f64,
    pub state: HistoryState,
    pub created_at: DateTime<Utc>,
    pub solved_at: Option<DateTime<Utc>>,
}

/// Where a user wants notifications delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserNotificationSettings {
    pub user_id: String,
    #[serde(default)]
    pub emails: Vec<String>,
    /// Delivery-channel URLs such as `ntfy://ntfy.sh/alerts`.
    #[serde(default)]
    pub webhooks: Vec<String>,
}

/// A rendered notification, ready for any channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub link: String,
    pub link_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_pct_reads_root_and_extra() {
        let mut snapshot = MetricSnapshot {
            disk_used: Some(50.0),
            disk_total: Some(200.0),
            ..Default::default()
        };
        snapshot.extra_fs.insert(
            "data".into(),
            FsUsage {
                disk_used: 90.0,
                disk_total: 100.0,
            },
        );
        assert_eq!(snapshot.filesystem_pct("root"), Some(25.0));
        assert_eq!(snapshot.filesystem_pct("data"), Some(90.0));
        assert_eq!(snapshot.filesystem_pct("missing"), None);
    }

    #[test]
    fn zero_total_has_no_usage() {
        let fs = FsUsage {
            disk_used: 0.0,
            disk_total: 0.0,
        };
        assert_eq!(fs.used_pct(), None);
    }

    #[test]
    fn snapshot_json_tolerates_missing_fields() {
        let json = r#"{"system_id":"s1","created_at":"2024-01-01T00:00:00Z","cpu":12.5}"#;
        let snapshot: MetricSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.cpu, Some(12.5));
        assert!(snapshot.mem_pct.is_none());
        assert!(snapshot.temperatures.is_empty());
    }
}
