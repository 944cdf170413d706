//! Persistence seams consumed by the alert engine.
//!
//! The engine never talks to a database directly. It goes through the
//! store traits below, which are implemented by [`sqlite::SqliteStore`]
//! (single-file SQLite with WAL) and by [`memory::MemoryStore`] for tests
//! and tooling. Bulk rule mutations with ownership checks and per-rule
//! locking live in [`bulk`].

pub mod bulk;
pub mod error;
pub mod memory;
pub mod sqlite;


use anyhow::Result;
use chrono::{DateTime, Utc};
use vigil_common::types::{
    AlertHistoryEntry, AlertRule, MetricSnapshot, SystemRecord, UserNotificationSettings,
};

/// Filter for [`RuleStore::list_rules`]. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub system_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    /// Excludes rules with this name, e.g. `"Status"` when evaluating metrics.
    pub name_ne: Option<String>,
    pub triggered: Option<bool>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &AlertRule) -> bool {
        self.system_id.as_ref().is_none_or(|s| *s == rule.system_id)
            && self.user_id.as_ref().is_none_or(|u| *u == rule.user_id)
            && self.name.as_ref().is_none_or(|n| *n == rule.name)
            && self.name_ne.as_ref().is_none_or(|n| *n != rule.name)
            && self.triggered.is_none_or(|t| t == rule.triggered)
    }
}

/// Result of a bulk create-or-update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// CRUD over alert rules.
pub trait RuleStore: Send + Sync {
    fn get_rule(&self, id: &str) -> Result<Option<AlertRule>>;

    fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>>;

    /// Persists `triggered`, `repeat_count`, `last_sent` and `updated_at`
    /// of an existing rule. Fails if the rule no longer exists.
    fn save_rule(&self, rule: &AlertRule) -> Result<()>;

    /// Records one repeat notification: sets `repeat_count` to
    /// `expected_count + 1` and `last_sent`/`updated_at` to `sent_at`, but
    /// only while the rule is still triggered and its count is still
    /// `expected_count`. Returns `false` when nothing matched.
    fn record_repeat(&self, id: &str, expected_count: u32, sent_at: DateTime<Utc>) -> Result<bool>;

    /// Creates each rule unless one already exists for the same
    /// `(user, system, name, filesystem)`. Existing rules are left untouched
    /// unless `overwrite` is set, in which case their threshold, window and
    /// repeat settings are replaced. All-or-nothing.
    fn upsert_rules(&self, rules: &[AlertRule], overwrite: bool) -> Result<UpsertOutcome>;

    /// Deletes the user's rules named `name` on the given systems. Returns
    /// how many rules were removed.
    fn delete_rules(&self, user_id: &str, name: &str, system_ids: &[String]) -> Result<usize>;
}

/// Time-ordered metric snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Appends a snapshot and returns its sequence number.
    fn insert_snapshot(&self, snapshot: &MetricSnapshot) -> Result<i64>;

    /// Snapshots of one system with `from <= created_at <= to`, oldest first.
    fn query_snapshots(
        &self,
        system_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>>;

    /// Snapshots inserted after sequence number `after`, in insertion order.
    fn snapshots_after(&self, after: i64, limit: usize) -> Result<Vec<(i64, MetricSnapshot)>>;

    /// Highest sequence number handed out so far, 0 when empty.
    fn latest_sequence(&self) -> Result<i64>;
}

/// Append-mostly alert audit trail.
pub trait HistoryStore: Send + Sync {
    fn create_history(&self, entry: &AlertHistoryEntry) -> Result<()>;

    /// Most recent entry for the rule that is still `active`.
    fn latest_active(&self, alert_id: &str) -> Result<Option<AlertHistoryEntry>>;

    fn update_history(&self, entry: &AlertHistoryEntry) -> Result<()>;

    /// All entries for a rule, oldest first.
    fn list_history(&self, alert_id: &str) -> Result<Vec<AlertHistoryEntry>>;

    /// Removes solved entries resolved before `cutoff`. Returns the count.
    fn delete_solved_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Monitored systems and their owners.
pub trait SystemStore: Send + Sync {
    fn get_system(&self, id: &str) -> Result<Option<SystemRecord>>;

    fn list_systems(&self) -> Result<Vec<SystemRecord>>;

    fn upsert_system(&self, system: &SystemRecord) -> Result<()>;
}

/// Per-user notification targets.
pub trait UserSettingsStore: Send + Sync {
    fn get_user_settings(&self, user_id: &str) -> Result<Option<UserNotificationSettings>>;

    fn save_user_settings(&self, settings: &UserNotificationSettings) -> Result<()>;
}

/// Convenience bound for a backend that implements every store.
pub trait Store:
    RuleStore + SnapshotStore + HistoryStore + SystemStore + UserSettingsStore
{
}

impl<T> Store for T where
    T: RuleStore + SnapshotStore + HistoryStore + SystemStore + UserSettingsStore
{
}
