use crate::error::StorageError;
use crate::{
    HistoryStore, RuleFilter, RuleStore, SnapshotStore, SystemStore, UpsertOutcome,
    UserSettingsStore,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use vigil_common::types::{
    AlertHistoryEntry, AlertRule, HistoryState, MetricSnapshot, SystemRecord,
    UserNotificationSettings,
};

#[derive(Default)]
struct Inner {
    rules: Vec<AlertRule>,
    snapshots: Vec<(i64, MetricSnapshot)>,
    history: Vec<AlertHistoryEntry>,
    systems: HashMap<String, SystemRecord>,
    settings: HashMap<String, UserNotificationSettings>,
    next_seq: i64,
    fail_rule_saves: bool,
    fail_history_writes: bool,
}

/// Process-local store. Used by tests and by tooling that does not need
/// persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every subsequent [`RuleStore::save_rule`] fail, to exercise
    /// persistence-error paths.
    pub fn set_fail_rule_saves(&self, fail: bool) {
        self.lock().fail_rule_saves = fail;
    }

    /// Makes every subsequent history create or update fail.
    pub fn set_fail_history_writes(&self, fail: bool) {
        self.lock().fail_history_writes = fail;
    }
}

impl RuleStore for MemoryStore {
    fn get_rule(&self, id: &str) -> Result<Option<AlertRule>> {
        Ok(self.lock().rules.iter().find(|r| r.id == id).cloned())
    }

    fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>> {
        Ok(self
            .lock()
            .rules
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn save_rule(&self, rule: &AlertRule) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_rule_saves {
            anyhow::bail!("rule store unavailable");
        }
        let existing = inner
            .rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "alert_rule",
                id: rule.id.clone(),
            })?;
        existing.triggered = rule.triggered;
        existing.repeat_count = rule.repeat_count;
        existing.last_sent = rule.last_sent;
        existing.updated_at = rule.updated_at;
        Ok(())
    }

    fn record_repeat(&self, id: &str, expected_count: u32, sent_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        if inner.fail_rule_saves {
            anyhow::bail!("rule store unavailable");
        }
        let Some(rule) = inner
            .rules
            .iter_mut()
            .find(|r| r.id == id && r.triggered && r.repeat_count == expected_count)
        else {
            return Ok(false);
        };
        rule.repeat_count = expected_count + 1;
        rule.last_sent = Some(sent_at);
        rule.updated_at = sent_at;
        Ok(true)
    }

    fn upsert_rules(&self, rules: &[AlertRule], overwrite: bool) -> Result<UpsertOutcome> {
        let mut inner = self.lock();
        let mut outcome = UpsertOutcome::default();
        for rule in rules {
            let existing = inner.rules.iter_mut().find(|r| {
                r.user_id == rule.user_id
                    && r.system_id == rule.system_id
                    && r.name == rule.name
                    && r.filesystem == rule.filesystem
            });
            match existing {
                Some(_) if !overwrite => outcome.skipped += 1,
                Some(existing) => {
                    existing.threshold = rule.threshold;
                    existing.min_duration_minutes = rule.min_duration_minutes;
                    existing.repeat_interval_minutes = rule.repeat_interval_minutes;
                    existing.max_repeats = rule.max_repeats;
                    existing.updated_at = rule.updated_at;
                    outcome.updated += 1;
                }
                None => {
                    inner.rules.push(rule.clone());
                    outcome.created += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn delete_rules(&self, user_id: &str, name: &str, system_ids: &[String]) -> Result<usize> {
        let mut inner = self.lock();
        let before = inner.rules.len();
        inner.rules.retain(|r| {
            !(r.user_id == user_id && r.name == name && system_ids.contains(&r.system_id))
        });
        Ok(before - inner.rules.len())
    }
}

impl SnapshotStore for MemoryStore {
    fn insert_snapshot(&self, snapshot: &MetricSnapshot) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.snapshots.push((seq, snapshot.clone()));
        Ok(seq)
    }

    fn query_snapshots(
        &self,
        system_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>> {
        let mut found: Vec<MetricSnapshot> = self
            .lock()
            .snapshots
            .iter()
            .map(|(_, s)| s)
            .filter(|s| s.system_id == system_id && s.created_at >= from && s.created_at <= to)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    fn snapshots_after(&self, after: i64, limit: usize) -> Result<Vec<(i64, MetricSnapshot)>> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(limit)
            .cloned()
            .collect())
    }

    fn latest_sequence(&self) -> Result<i64> {
        Ok(self.lock().next_seq)
    }
}

impl HistoryStore for MemoryStore {
    fn create_history(&self, entry: &AlertHistoryEntry) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_history_writes {
            anyhow::bail!("history store unavailable");
        }
        inner.history.push(entry.clone());
        Ok(())
    }

    fn latest_active(&self, alert_id: &str) -> Result<Option<AlertHistoryEntry>> {
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|e| e.alert_id == alert_id && e.state == HistoryState::Active)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    fn update_history(&self, entry: &AlertHistoryEntry) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_history_writes {
            anyhow::bail!("history store unavailable");
        }
        let existing = inner
            .history
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "alert_history",
                id: entry.id.clone(),
            })?;
        *existing = entry.clone();
        Ok(())
    }

    fn list_history(&self, alert_id: &str) -> Result<Vec<AlertHistoryEntry>> {
        let mut entries: Vec<AlertHistoryEntry> = self
            .lock()
            .history
            .iter()
            .filter(|e| e.alert_id == alert_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    fn delete_solved_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock();
        let before = inner.history.len();
        inner.history.retain(|e| {
            !(e.state == HistoryState::Solved && e.solved_at.is_some_and(|t| t < cutoff))
        });
        Ok(before - inner.history.len())
    }
}

impl SystemStore for MemoryStore {
    fn get_system(&self, id: &str) -> Result<Option<SystemRecord>> {
        Ok(self.lock().systems.get(id).cloned())
    }

    fn list_systems(&self) -> Result<Vec<SystemRecord>> {
        let mut systems: Vec<SystemRecord> = self.lock().systems.values().cloned().collect();
        systems.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(systems)
    }

    fn upsert_system(&self, system: &SystemRecord) -> Result<()> {
        self.lock()
            .systems
            .insert(system.id.clone(), system.clone());
        Ok(())
    }
}

impl UserSettingsStore for MemoryStore {
    fn get_user_settings(&self, user_id: &str) -> Result<Option<UserNotificationSettings>> {
        Ok(self.lock().settings.get(user_id).cloned())
    }

    fn save_user_settings(&self, settings: &UserNotificationSettings) -> Result<()> {
        self.lock()
            .settings
            .insert(settings.user_id.clone(), settings.clone());
        Ok(())
    }
}
