use chrono::{DateTime, Utc};
use std::sync::Arc;
use vigil_common::types::{AlertHistoryEntry, AlertRule, HistoryState};
use vigil_storage::HistoryStore;

/// Keeps the audit trail of trigger and clear transitions.
///
/// At most one `active` entry exists per rule; opening a second one is
/// logged and ignored.
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Records a trigger. Returns the new entry, or `None` if the rule
    /// already has an active one.
    pub fn open(
        &self,
        rule: &AlertRule,
        value: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<AlertHistoryEntry>> {
        if let Some(existing) = self.store.latest_active(&rule.id)? {
            tracing::warn!(
                rule_id = %rule.id,
                history_id = %existing.id,
                "Rule already has an active history entry, not opening another"
            );
            return Ok(None);
        }

        let entry = AlertHistoryEntry {
            id: vigil_common::id::next_id(),
            alert_id: rule.id.clone(),
            user_id: rule.user_id.clone(),
            system_id: rule.system_id.clone(),
            name: rule.name.clone(),
            value,
            state: HistoryState::Active,
            created_at: now,
            solved_at: None,
        };
        self.store.create_history(&entry)?;
        Ok(Some(entry))
    }

    /// Marks the rule's active entry solved. Returns it, or `None` when the
    /// rule had nothing open.
    pub fn resolve(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<AlertHistoryEntry>> {
        let Some(mut entry) = self.store.latest_active(&rule.id)? else {
            tracing::debug!(rule_id = %rule.id, "No active history entry to solve");
            return Ok(None);
        };
        entry.state = HistoryState::Solved;
        entry.solved_at = Some(now.max(entry.created_at));
        self.store.update_history(&entry)?;
        Ok(Some(entry))
    }
}
