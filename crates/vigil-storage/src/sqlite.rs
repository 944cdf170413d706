use crate::error::StorageError;
use crate::{
    HistoryStore, RuleFilter, RuleStore, SnapshotStore, SystemStore, UpsertOutcome,
    UserSettingsStore,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use vigil_common::types::{
    AlertHistoryEntry, AlertRule, HistoryState, MetricSnapshot, SystemRecord, SystemStatus,
    UserNotificationSettings,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS systems (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    users TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS alert_rules (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    system_id TEXT NOT NULL,
    name TEXT NOT NULL,
    filesystem TEXT NOT NULL DEFAULT '',
    threshold REAL NOT NULL,
    min_duration INTEGER NOT NULL,
    triggered INTEGER NOT NULL DEFAULT 0,
    repeat_interval INTEGER NOT NULL DEFAULT 0,
    max_repeats INTEGER NOT NULL DEFAULT 0,
    repeat_count INTEGER NOT NULL DEFAULT 0,
    last_sent INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_alert_rules_target
    ON alert_rules(user_id, system_id, name, filesystem);
CREATE INDEX IF NOT EXISTS idx_alert_rules_system ON alert_rules(system_id);
CREATE TABLE IF NOT EXISTS system_stats (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    system_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    stats TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_stats_system_time
    ON system_stats(system_id, created_at);
CREATE TABLE IF NOT EXISTS alerts_history (
    id TEXT PRIMARY KEY,
    alert_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    system_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value REAL NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    solved_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_alerts_history_alert ON alerts_history(alert_id, state);
CREATE TABLE IF NOT EXISTS user_settings (
    user_id TEXT PRIMARY KEY,
    emails TEXT NOT NULL DEFAULT '[]',
    webhooks TEXT NOT NULL DEFAULT '[]'
);
";

const RULE_COLUMNS: &str = "id, user_id, system_id, name, filesystem, threshold, min_duration, \
     triggered, repeat_interval, max_repeats, repeat_count, last_sent, created_at, updated_at";

const HISTORY_COLUMNS: &str =
    "id, alert_id, user_id, system_id, name, value, state, created_at, solved_at";

/// Single-file SQLite backend for every store trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("SQLite schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn filesystem_key(filesystem: &Option<String>) -> &str {
    filesystem.as_deref().unwrap_or("")
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
    let filesystem: String = row.get(4)?;
    let last_sent: Option<i64> = row.get(11)?;
    Ok(AlertRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        system_id: row.get(2)?,
        name: row.get(3)?,
        filesystem: (!filesystem.is_empty()).then_some(filesystem),
        threshold: row.get(5)?,
        min_duration_minutes: row.get(6)?,
        triggered: row.get(7)?,
        repeat_interval_minutes: row.get(8)?,
        max_repeats: row.get(9)?,
        repeat_count: row.get(10)?,
        last_sent: last_sent.map(from_millis),
        created_at: from_millis(row.get(12)?),
        updated_at: from_millis(row.get(13)?),
    })
}

type HistoryRow = (String, String, String, String, String, f64, String, i64, Option<i64>);

fn history_row(row: &Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn history_from_row(raw: HistoryRow) -> Result<AlertHistoryEntry> {
    let (id, alert_id, user_id, system_id, name, value, state, created_ms, solved_ms) = raw;
    let state: HistoryState = state
        .parse()
        .map_err(|_| StorageError::InvalidColumn {
            column: "state",
            value: state.clone(),
        })?;
    Ok(AlertHistoryEntry {
        id,
        alert_id,
        user_id,
        system_id,
        name,
        value,
        state,
        created_at: from_millis(created_ms),
        solved_at: solved_ms.map(from_millis),
    })
}

impl RuleStore for SqliteStore {
    fn get_rule(&self, id: &str) -> Result<Option<AlertRule>> {
        let conn = self.lock();
        let rule = conn
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = ?1"),
                [id],
                rule_from_row,
            )
            .optional()?;
        Ok(rule)
    }

    fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>> {
        let mut sql = format!("SELECT {RULE_COLUMNS} FROM alert_rules WHERE 1 = 1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(system_id) = &filter.system_id {
            params.push(Box::new(system_id.clone()));
            sql.push_str(&format!(" AND system_id = ?{}", params.len()));
        }
        if let Some(user_id) = &filter.user_id {
            params.push(Box::new(user_id.clone()));
            sql.push_str(&format!(" AND user_id = ?{}", params.len()));
        }
        if let Some(name) = &filter.name {
            params.push(Box::new(name.clone()));
            sql.push_str(&format!(" AND name = ?{}", params.len()));
        }
        if let Some(name) = &filter.name_ne {
            params.push(Box::new(name.clone()));
            sql.push_str(&format!(" AND name != ?{}", params.len()));
        }
        if let Some(triggered) = filter.triggered {
            params.push(Box::new(triggered));
            sql.push_str(&format!(" AND triggered = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY created_at ASC");

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), rule_from_row)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    fn save_rule(&self, rule: &AlertRule) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE alert_rules SET triggered = ?1, repeat_count = ?2, last_sent = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![
                rule.triggered,
                rule.repeat_count,
                rule.last_sent.map(to_millis),
                to_millis(rule.updated_at),
                &rule.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound {
                entity: "alert_rule",
                id: rule.id.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn record_repeat(&self, id: &str, expected_count: u32, sent_at: DateTime<Utc>) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE alert_rules SET repeat_count = ?1, last_sent = ?2, updated_at = ?2
             WHERE id = ?3 AND triggered = 1 AND repeat_count = ?4",
            rusqlite::params![expected_count + 1, to_millis(sent_at), id, expected_count],
        )?;
        Ok(changed == 1)
    }

    fn upsert_rules(&self, rules: &[AlertRule], overwrite: bool) -> Result<UpsertOutcome> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut outcome = UpsertOutcome::default();
        {
            let mut find = tx.prepare_cached(
                "SELECT id FROM alert_rules
                 WHERE user_id = ?1 AND system_id = ?2 AND name = ?3 AND filesystem = ?4",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE alert_rules SET threshold = ?1, min_duration = ?2, repeat_interval = ?3,
                 max_repeats = ?4, updated_at = ?5 WHERE id = ?6",
            )?;
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO alert_rules ({RULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ))?;

            for rule in rules {
                let existing: Option<String> = find
                    .query_row(
                        rusqlite::params![
                            &rule.user_id,
                            &rule.system_id,
                            &rule.name,
                            filesystem_key(&rule.filesystem),
                        ],
                        |row| row.get(0),
                    )
                    .optional()?;

                match existing {
                    Some(_) if !overwrite => outcome.skipped += 1,
                    Some(id) => {
                        update.execute(rusqlite::params![
                            rule.threshold,
                            rule.min_duration_minutes,
                            rule.repeat_interval_minutes,
                            rule.max_repeats,
                            to_millis(rule.updated_at),
                            id,
                        ])?;
                        outcome.updated += 1;
                    }
                    None => {
                        insert.execute(rusqlite::params![
                            &rule.id,
                            &rule.user_id,
                            &rule.system_id,
                            &rule.name,
                            filesystem_key(&rule.filesystem),
                            rule.threshold,
                            rule.min_duration_minutes,
                            rule.triggered,
                            rule.repeat_interval_minutes,
                            rule.max_repeats,
                            rule.repeat_count,
                            rule.last_sent.map(to_millis),
                            to_millis(rule.created_at),
                            to_millis(rule.updated_at),
                        ])?;
                        outcome.created += 1;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    fn delete_rules(&self, user_id: &str, name: &str, system_ids: &[String]) -> Result<usize> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM alert_rules WHERE user_id = ?1 AND name = ?2 AND system_id = ?3",
            )?;
            for system_id in system_ids {
                removed += stmt.execute(rusqlite::params![user_id, name, system_id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

impl SnapshotStore for SqliteStore {
    fn insert_snapshot(&self, snapshot: &MetricSnapshot) -> Result<i64> {
        let stats = serde_json::to_string(snapshot)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO system_stats (system_id, created_at, stats) VALUES (?1, ?2, ?3)",
            rusqlite::params![&snapshot.system_id, to_millis(snapshot.created_at), stats],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query_snapshots(
        &self,
        system_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stats FROM system_stats
             WHERE system_id = ?1 AND created_at >= ?2 AND created_at <= ?3
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![system_id, to_millis(from), to_millis(to)],
            |row| row.get::<_, String>(0),
        )?;
        let mut snapshots = Vec::new();
        for row in rows {
            let stats = row?;
            let snapshot: MetricSnapshot =
                serde_json::from_str(&stats).map_err(StorageError::from)?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    fn snapshots_after(&self, after: i64, limit: usize) -> Result<Vec<(i64, MetricSnapshot)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT seq, stats FROM system_stats WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![after, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            let (seq, stats) = row?;
            match serde_json::from_str::<MetricSnapshot>(&stats) {
                Ok(snapshot) => snapshots.push((seq, snapshot)),
                Err(e) => {
                    tracing::warn!(seq, error = %e, "Skipping malformed snapshot payload");
                }
            }
        }
        Ok(snapshots)
    }

    fn latest_sequence(&self) -> Result<i64> {
        let conn = self.lock();
        let seq: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM system_stats", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }
}

impl HistoryStore for SqliteStore {
    fn create_history(&self, entry: &AlertHistoryEntry) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO alerts_history ({HISTORY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            rusqlite::params![
                &entry.id,
                &entry.alert_id,
                &entry.user_id,
                &entry.system_id,
                &entry.name,
                entry.value,
                entry.state.to_string(),
                to_millis(entry.created_at),
                entry.solved_at.map(to_millis),
            ],
        )?;
        Ok(())
    }

    fn latest_active(&self, alert_id: &str) -> Result<Option<AlertHistoryEntry>> {
        let raw = {
            let conn = self.lock();
            conn.query_row(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM alerts_history
                     WHERE alert_id = ?1 AND state = 'active'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                [alert_id],
                history_row,
            )
            .optional()?
        };
        raw.map(history_from_row).transpose()
    }

    fn update_history(&self, entry: &AlertHistoryEntry) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE alerts_history SET value = ?1, state = ?2, solved_at = ?3 WHERE id = ?4",
            rusqlite::params![
                entry.value,
                entry.state.to_string(),
                entry.solved_at.map(to_millis),
                &entry.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound {
                entity: "alert_history",
                id: entry.id.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn list_history(&self, alert_id: &str) -> Result<Vec<AlertHistoryEntry>> {
        let raws = {
            let conn = self.lock();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {HISTORY_COLUMNS} FROM alerts_history
                 WHERE alert_id = ?1 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([alert_id], history_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(history_from_row).collect()
    }

    fn delete_solved_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM alerts_history WHERE state = 'solved' AND solved_at < ?1",
            [to_millis(cutoff)],
        )?;
        Ok(removed)
    }
}

fn system_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_system(raw: (String, String, String, String)) -> Result<SystemRecord> {
    let (id, name, users, status) = raw;
    let users: Vec<String> = serde_json::from_str(&users).map_err(StorageError::from)?;
    let status: SystemStatus = status
        .parse()
        .map_err(|_| StorageError::InvalidColumn {
            column: "status",
            value: status.clone(),
        })?;
    Ok(SystemRecord {
        id,
        name,
        users,
        status,
    })
}

impl SystemStore for SqliteStore {
    fn get_system(&self, id: &str) -> Result<Option<SystemRecord>> {
        let raw = {
            let conn = self.lock();
            conn.query_row(
                "SELECT id, name, users, status FROM systems WHERE id = ?1",
                [id],
                system_from_row,
            )
            .optional()?
        };
        raw.map(decode_system).transpose()
    }

    fn list_systems(&self) -> Result<Vec<SystemRecord>> {
        let raws = {
            let conn = self.lock();
            let mut stmt =
                conn.prepare_cached("SELECT id, name, users, status FROM systems ORDER BY name")?;
            let rows = stmt.query_map([], system_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(decode_system).collect()
    }

    fn upsert_system(&self, system: &SystemRecord) -> Result<()> {
        let users = serde_json::to_string(&system.users)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO systems (id, name, users, status) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, users = excluded.users,
             status = excluded.status",
            rusqlite::params![&system.id, &system.name, users, system.status.to_string()],
        )?;
        Ok(())
    }
}

impl UserSettingsStore for SqliteStore {
    fn get_user_settings(&self, user_id: &str) -> Result<Option<UserNotificationSettings>> {
        let raw: Option<(String, String)> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT emails, webhooks FROM user_settings WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        let Some((emails, webhooks)) = raw else {
            return Ok(None);
        };
        Ok(Some(UserNotificationSettings {
            user_id: user_id.to_string(),
            emails: serde_json::from_str(&emails)?,
            webhooks: serde_json::from_str(&webhooks)?,
        }))
    }

    fn save_user_settings(&self, settings: &UserNotificationSettings) -> Result<()> {
        let emails = serde_json::to_string(&settings.emails)?;
        let webhooks = serde_json::to_string(&settings.webhooks)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO user_settings (user_id, emails, webhooks) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET emails = excluded.emails,
             webhooks = excluded.webhooks",
            rusqlite::params![&settings.user_id, emails, webhooks],
        )?;
        Ok(())
    }
}
