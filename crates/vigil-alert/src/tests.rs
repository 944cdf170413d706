use crate::engine::{AlertEngine, EngineConfig};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use vigil_common::types::{
    AlertHistoryEntry, AlertRule, FsUsage, HistoryState, MetricSnapshot, Notification,
    SystemRecord, SystemStatus, UserNotificationSettings,
};
use vigil_notify::NotificationSink;
use vigil_storage::memory::MemoryStore;
use vigil_storage::{
    HistoryStore, RuleFilter, RuleStore, SnapshotStore, SystemStore, UpsertOutcome,
    UserSettingsStore,
};

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    fn all(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    fn titles(&self) -> Vec<String> {
        self.all().into_iter().map(|n| n.title).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    engine: AlertEngine,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = EngineConfig {
            app_url: "https://vigil.example.com".into(),
            // Keep the real-time scan out of the way; tests flush explicitly.
            status_scan_interval: std::time::Duration::from_secs(3600),
        };
        let (engine, _worker) = AlertEngine::start(store.clone(), sink.clone(), config, shutdown_rx);
        let harness = Self {
            store,
            sink,
            engine,
            _shutdown: shutdown_tx,
        };
        harness.set_status("s1", SystemStatus::Up);
        harness
    }

    fn set_status(&self, id: &str, status: SystemStatus) -> SystemRecord {
        let system = SystemRecord {
            id: id.into(),
            name: if id == "s1" { "web-01".into() } else { format!("host-{id}") },
            users: vec!["u1".into()],
            status,
        };
        self.store.upsert_system(&system).unwrap();
        system
    }

    fn add_rule(&self, id: &str, name: &str, threshold: f64, minutes: u32) -> AlertRule {
        self.add_rule_on("s1", id, name, threshold, minutes, |_| {})
    }

    fn add_rule_on(
        &self,
        system_id: &str,
        id: &str,
        name: &str,
        threshold: f64,
        minutes: u32,
        tweak: impl FnOnce(&mut AlertRule),
    ) -> AlertRule {
        let now = Utc::now();
        let mut rule = AlertRule {
            id: id.into(),
            user_id: "u1".into(),
            system_id: system_id.into(),
            name: name.into(),
            filesystem: None,
            threshold,
            min_duration_minutes: minutes,
            triggered: false,
            repeat_interval_minutes: 0,
            max_repeats: 0,
            repeat_count: 0,
            last_sent: None,
            created_at: now,
            updated_at: now,
        };
        tweak(&mut rule);
        self.store.upsert_rules(&[rule.clone()], false).unwrap();
        rule
    }

    fn rule(&self, id: &str) -> AlertRule {
        self.store.get_rule(id).unwrap().unwrap()
    }

    fn insert(&self, snapshot: MetricSnapshot) -> MetricSnapshot {
        self.store.insert_snapshot(&snapshot).unwrap();
        snapshot
    }

    fn cpu(&self, at: DateTime<Utc>, value: f64) -> MetricSnapshot {
        self.insert(MetricSnapshot {
            system_id: "s1".into(),
            created_at: at,
            cpu: Some(value),
            ..Default::default()
        })
    }

    /// Inserts one snapshot per minute ending at `end` and evaluates the
    /// last one.
    fn feed_cpu(&self, end: DateTime<Utc>, values: &[f64]) -> usize {
        let n = values.len() as i64;
        let mut last = None;
        for (i, &v) in values.iter().enumerate() {
            last = Some(self.cpu(end - Duration::minutes(n - 1 - i as i64), v));
        }
        let system = self.store.get_system("s1").unwrap().unwrap();
        self.engine
            .handle_snapshot(&system, &last.unwrap(), end)
            .unwrap()
    }

    fn evaluate(&self, snapshot: &MetricSnapshot, now: DateTime<Utc>) -> usize {
        let system = self.store.get_system("s1").unwrap().unwrap();
        self.engine.handle_snapshot(&system, snapshot, now).unwrap()
    }
}

// ---- threshold rules ----

#[tokio::test]
async fn cpu_window_mean_triggers_once_then_clears_once() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 5);
    let t0 = Utc::now();

    assert_eq!(h.feed_cpu(t0, &[70.0, 75.0, 85.0, 88.0, 90.0]), 1);
    assert!(h.rule("cpu").triggered);
    let sent = h.sink.all();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "web-01 CPU above threshold");
    assert_eq!(
        sent[0].message,
        "CPU averaged 81.60% for the previous 5 minutes."
    );
    assert_eq!(sent[0].link, "https://vigil.example.com/system/web-01");
    assert_eq!(sent[0].link_text, "View web-01");

    // Still above threshold: no second trigger.
    let again = h.cpu(t0 + Duration::seconds(30), 92.0);
    assert_eq!(h.evaluate(&again, t0 + Duration::seconds(30)), 0);
    assert_eq!(h.sink.all().len(), 1);

    let t1 = t0 + Duration::minutes(10);
    assert_eq!(h.feed_cpu(t1, &[60.0; 5]), 1);
    assert!(!h.rule("cpu").triggered);
    let sent = h.sink.all();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].title, "web-01 CPU below threshold");
    assert_eq!(
        sent[1].message,
        "CPU averaged 60.00% for the previous 5 minutes."
    );
}

#[tokio::test]
async fn sparse_window_produces_no_transition() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 10);
    let t0 = Utc::now();

    h.cpu(t0 - Duration::minutes(8), 99.0);
    h.cpu(t0 - Duration::minutes(4), 99.0);
    let last = h.cpu(t0, 99.0);

    assert_eq!(h.evaluate(&last, t0), 0);
    assert!(!h.rule("cpu").triggered);
    assert!(h.sink.all().is_empty());
}

#[tokio::test]
async fn value_at_threshold_is_not_triggered() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();

    let s = h.cpu(t0, 80.0);
    assert_eq!(h.evaluate(&s, t0), 0);

    let s = h.cpu(t0 + Duration::minutes(1), 80.5);
    assert_eq!(h.evaluate(&s, t0 + Duration::minutes(1)), 1);

    // Dropping but still above the threshold keeps it triggered.
    let s = h.cpu(t0 + Duration::minutes(2), 80.1);
    assert_eq!(h.evaluate(&s, t0 + Duration::minutes(2)), 0);

    let s = h.cpu(t0 + Duration::minutes(3), 80.0);
    assert_eq!(h.evaluate(&s, t0 + Duration::minutes(3)), 1);
    assert_eq!(
        h.sink.titles(),
        vec!["web-01 CPU above threshold", "web-01 CPU below threshold"]
    );
}

#[tokio::test]
async fn one_minute_window_uses_latest_snapshot_only() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();

    // Never stored: the instant path must not need history.
    let snapshot = MetricSnapshot {
        system_id: "s1".into(),
        created_at: t0,
        cpu: Some(95.0),
        ..Default::default()
    };
    assert_eq!(h.evaluate(&snapshot, t0), 1);
    assert_eq!(
        h.sink.all()[0].message,
        "CPU averaged 95.00% for the previous 1 minute."
    );
}

#[tokio::test]
async fn failed_rule_save_aborts_transition() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();
    let s = h.cpu(t0, 95.0);

    h.store.set_fail_rule_saves(true);
    assert_eq!(h.evaluate(&s, t0), 0);
    assert!(!h.rule("cpu").triggered);
    assert!(h.sink.all().is_empty());
    assert!(h.store.list_history("cpu").unwrap().is_empty());

    // Retried on the next snapshot once the store recovers.
    h.store.set_fail_rule_saves(false);
    let s = h.cpu(t0 + Duration::minutes(1), 95.0);
    assert_eq!(h.evaluate(&s, t0 + Duration::minutes(1)), 1);
    assert!(h.rule("cpu").triggered);
    assert_eq!(h.store.list_history("cpu").unwrap().len(), 1);
}

#[tokio::test]
async fn failed_history_write_aborts_trigger() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();
    let s = h.cpu(t0, 95.0);

    h.store.set_fail_history_writes(true);
    assert_eq!(h.evaluate(&s, t0), 0);
    let rule = h.rule("cpu");
    assert!(!rule.triggered);
    assert_eq!(rule.updated_at, rule.created_at);
    assert!(h.sink.all().is_empty());

    h.store.set_fail_history_writes(false);
    let at = t0 + Duration::minutes(1);
    let s = h.cpu(at, 95.0);
    assert_eq!(h.evaluate(&s, at), 1);
    assert!(h.rule("cpu").triggered);
    assert_eq!(h.sink.all().len(), 1);
    let entries = h.store.list_history("cpu").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, HistoryState::Active);
}

#[tokio::test]
async fn failed_history_write_aborts_clear() {
    let h = Harness::new();
    h.add_rule_on("s1", "cpu", "CPU", 80.0, 1, |r| {
        r.repeat_interval_minutes = 5;
    });
    let t0 = Utc::now();
    let s = h.cpu(t0, 95.0);
    assert_eq!(h.evaluate(&s, t0), 1);
    assert_eq!(h.engine.repeat_scheduler().tick(t0 + Duration::minutes(1)).unwrap(), 1);

    h.store.set_fail_history_writes(true);
    let at = t0 + Duration::minutes(2);
    let s = h.cpu(at, 10.0);
    assert_eq!(h.evaluate(&s, at), 0);
    let rule = h.rule("cpu");
    assert!(rule.triggered);
    assert_eq!(rule.repeat_count, 1);
    assert_eq!(h.sink.all().len(), 2);

    h.store.set_fail_history_writes(false);
    let at = t0 + Duration::minutes(3);
    let s = h.cpu(at, 10.0);
    assert_eq!(h.evaluate(&s, at), 1);
    assert!(!h.rule("cpu").triggered);
    let entries = h.store.list_history("cpu").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, HistoryState::Solved);
}

#[tokio::test]
async fn failed_history_write_keeps_status_alert_pending() {
    let h = Harness::new();
    h.add_rule("status", "Status", 0.0, 1);
    let t0 = Utc::now();
    let down = h.set_status("s1", SystemStatus::Down);
    h.engine.handle_status_change(&down, t0).await.unwrap();

    h.engine.force_expire_pending_status(t0).await.unwrap();

    h.store.set_fail_history_writes(true);
    assert_eq!(h.engine.flush_pending_status(t0).await.unwrap(), 0);
    assert!(!h.rule("status").triggered);
    assert!(h.sink.all().is_empty());
    assert_eq!(h.engine.status_scheduler().pending_count().await.unwrap(), 1);

    h.store.set_fail_history_writes(false);
    assert_eq!(h.engine.flush_pending_status(t0).await.unwrap(), 1);
    assert!(h.rule("status").triggered);
    assert_eq!(h.sink.titles(), vec!["Connection to web-01 is down 🔴"]);
}

fn disk_snapshot(at: DateTime<Utc>, root: f64, data: f64, boot: f64) -> MetricSnapshot {
    let mut snapshot = MetricSnapshot {
        system_id: "s1".into(),
        created_at: at,
        disk_used: Some(root),
        disk_total: Some(100.0),
        ..Default::default()
    };
    for (name, used) in [("data", data), ("boot", boot)] {
        snapshot.extra_fs.insert(
            name.into(),
            FsUsage {
                disk_used: used,
                disk_total: 100.0,
            },
        );
    }
    snapshot
}

#[tokio::test]
async fn legacy_disk_rule_notifies_each_full_filesystem() {
    let h = Harness::new();
    h.add_rule("disk", "Disk", 80.0, 1);
    let t0 = Utc::now();

    let s = h.insert(disk_snapshot(t0, 85.0, 90.0, 10.0));
    assert_eq!(h.evaluate(&s, t0), 1);
    let messages: Vec<String> = h.sink.all().into_iter().map(|n| n.message).collect();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().any(|m| m.starts_with("Usage of root averaged 85.00%")));
    assert!(messages.iter().any(|m| m.starts_with("Usage of data averaged 90.00%")));

    // One filesystem recovering is not enough to clear.
    let t1 = t0 + Duration::minutes(1);
    let s = h.insert(disk_snapshot(t1, 70.0, 85.0, 10.0));
    assert_eq!(h.evaluate(&s, t1), 0);
    assert!(h.rule("disk").triggered);

    let t2 = t0 + Duration::minutes(2);
    let s = h.insert(disk_snapshot(t2, 70.0, 80.0, 10.0));
    assert_eq!(h.evaluate(&s, t2), 1);
    let sent = h.sink.all();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].title, "web-01 disk below threshold");
}

#[tokio::test]
async fn scoped_disk_rule_only_watches_its_filesystem() {
    let h = Harness::new();
    h.add_rule_on("s1", "disk-root", "Disk", 80.0, 1, |r| {
        r.filesystem = Some("root".into())
    });
    let t0 = Utc::now();

    let s = h.insert(disk_snapshot(t0, 50.0, 99.0, 99.0));
    assert_eq!(h.evaluate(&s, t0), 0);

    let s = h.insert(disk_snapshot(t0 + Duration::minutes(1), 81.0, 10.0, 10.0));
    assert_eq!(h.evaluate(&s, t0 + Duration::minutes(1)), 1);
    assert!(h.sink.all()[0].message.starts_with("Usage of root"));
}

#[tokio::test]
async fn temperature_reports_hottest_sensor() {
    let h = Harness::new();
    h.add_rule("temp", "Temperature", 70.0, 1);
    let t0 = Utc::now();

    let mut snapshot = MetricSnapshot {
        system_id: "s1".into(),
        created_at: t0,
        ..Default::default()
    };
    snapshot.temperatures.insert("cpu".into(), 85.0);
    snapshot.temperatures.insert("nvme".into(), 60.0);
    let s = h.insert(snapshot);

    assert_eq!(h.evaluate(&s, t0), 1);
    let sent = h.sink.all();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "web-01 temperature above threshold");
    assert_eq!(
        sent[0].message,
        "Highest sensor cpu averaged 85.00°C for the previous 1 minute."
    );
}

#[tokio::test]
async fn missing_or_unconfigured_metrics_are_skipped() {
    let h = Harness::new();
    h.add_rule("swap", "Swap", -1.0, 1);
    h.add_rule("mem", "Memory", -1.0, 1);
    let t0 = Utc::now();

    let s = h.insert(MetricSnapshot {
        system_id: "s1".into(),
        created_at: t0,
        swap_pct: Some(0.0),
        swap_used: Some(0.0),
        ..Default::default()
    });
    assert_eq!(h.evaluate(&s, t0), 0);
    assert!(h.sink.all().is_empty());
}

#[tokio::test]
async fn unknown_rule_names_and_paused_systems_are_ignored() {
    let h = Harness::new();
    h.add_rule("bogus", "Bogus", 1.0, 1);
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();
    let s = h.cpu(t0, 99.0);

    let paused = h.set_status("s1", SystemStatus::Paused);
    assert_eq!(h.engine.handle_snapshot(&paused, &s, t0).unwrap(), 0);

    h.set_status("s1", SystemStatus::Up);
    assert_eq!(h.evaluate(&s, t0), 1);
    assert_eq!(h.sink.all().len(), 1);
}

#[tokio::test]
async fn history_has_at_most_one_active_entry() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();

    for (i, value) in [90.0, 10.0, 90.0, 95.0, 10.0, 90.0].into_iter().enumerate() {
        let at = t0 + Duration::minutes(i as i64);
        let s = h.cpu(at, value);
        h.evaluate(&s, at);

        let entries = h.store.list_history("cpu").unwrap();
        let active = entries
            .iter()
            .filter(|e| e.state == HistoryState::Active)
            .count();
        assert!(active <= 1);
        for entry in entries.iter().filter(|e| e.state == HistoryState::Solved) {
            assert!(entry.solved_at.unwrap() >= entry.created_at);
        }
    }

    let entries = h.store.list_history("cpu").unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].state, HistoryState::Solved);
    assert_eq!(entries[0].value, 90.0);
    assert_eq!(entries[2].state, HistoryState::Active);
}

// ---- repeats ----

#[tokio::test]
async fn repeats_stop_at_max_and_restart_after_retrigger() {
    let h = Harness::new();
    h.add_rule_on("s1", "cpu", "CPU", 80.0, 1, |r| {
        r.repeat_interval_minutes = 5;
        r.max_repeats = 3;
    });
    let repeats = h.engine.repeat_scheduler();
    let t0 = Utc::now();

    let s = h.cpu(t0, 95.0);
    assert_eq!(h.evaluate(&s, t0), 1);

    let mut sent = 0;
    for minute in 1..=30 {
        sent += repeats.tick(t0 + Duration::minutes(minute)).unwrap();
    }
    assert_eq!(sent, 3);
    assert_eq!(repeats.tick(t0 + Duration::minutes(60)).unwrap(), 0);

    let all = h.sink.all();
    assert_eq!(all.len(), 4);
    assert_eq!(all[1].title, "web-01 CPU still above threshold");
    assert!(all[3].message.ends_with("(repeat 3 of 3)"));
    assert_eq!(h.rule("cpu").repeat_count, 3);

    // Clear and trigger again: repeats start over.
    let t1 = t0 + Duration::minutes(61);
    let s = h.cpu(t1, 10.0);
    assert_eq!(h.evaluate(&s, t1), 1);
    assert_eq!(h.rule("cpu").repeat_count, 0);
    assert!(h.rule("cpu").last_sent.is_none());

    let t2 = t1 + Duration::minutes(1);
    let s = h.cpu(t2, 95.0);
    assert_eq!(h.evaluate(&s, t2), 1);
    assert_eq!(repeats.tick(t2 + Duration::minutes(1)).unwrap(), 1);
    assert!(h.sink.all().last().unwrap().message.ends_with("(repeat 1 of 3)"));
    assert_eq!(repeats.tick(t2 + Duration::minutes(5)).unwrap(), 0);
    assert_eq!(repeats.tick(t2 + Duration::minutes(6)).unwrap(), 1);
}

#[tokio::test]
async fn repeats_disabled_when_interval_is_zero() {
    let h = Harness::new();
    h.add_rule("cpu", "CPU", 80.0, 1);
    let t0 = Utc::now();
    let s = h.cpu(t0, 95.0);
    h.evaluate(&s, t0);

    let repeats = h.engine.repeat_scheduler();
    assert_eq!(repeats.tick(t0 + Duration::hours(5)).unwrap(), 0);
}

// ---- status rules ----

#[tokio::test]
async fn short_outage_sends_nothing() {
    let h = Harness::new();
    h.add_rule("status", "Status", 0.0, 5);
    let t0 = Utc::now();

    let down = h.set_status("s1", SystemStatus::Down);
    h.engine.handle_status_change(&down, t0).await.unwrap();
    assert_eq!(h.engine.status_scheduler().pending_count().await.unwrap(), 1);

    let up = h.set_status("s1", SystemStatus::Up);
    h.engine
        .handle_status_change(&up, t0 + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(h.engine.status_scheduler().pending_count().await.unwrap(), 0);

    assert_eq!(
        h.engine
            .flush_pending_status(t0 + Duration::minutes(10))
            .await
            .unwrap(),
        0
    );
    assert!(h.sink.all().is_empty());
    assert!(!h.rule("status").triggered);
}

#[tokio::test]
async fn sustained_outage_fires_down_then_up() {
    let h = Harness::new();
    h.add_rule("status", "Status", 0.0, 5);
    let t0 = Utc::now();

    let down = h.set_status("s1", SystemStatus::Down);
    h.engine.handle_status_change(&down, t0).await.unwrap();
    // A repeated down report keeps the original grace period.
    h.engine
        .handle_status_change(&down, t0 + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(h.engine.status_scheduler().pending_count().await.unwrap(), 1);

    assert_eq!(
        h.engine
            .flush_pending_status(t0 + Duration::minutes(4))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.engine
            .flush_pending_status(t0 + Duration::minutes(5))
            .await
            .unwrap(),
        1
    );

    let sent = h.sink.all();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Connection to web-01 is down 🔴");
    assert_eq!(sent[0].message, "Connection to web-01 is down");
    assert!(h.rule("status").triggered);
    let history = h.store.latest_active("status").unwrap().unwrap();
    assert_eq!(history.value, 0.0);

    let up = h.set_status("s1", SystemStatus::Up);
    h.engine
        .handle_status_change(&up, t0 + Duration::minutes(7))
        .await
        .unwrap();
    assert_eq!(h.sink.titles()[1], "Connection to web-01 is up ✅");
    assert!(!h.rule("status").triggered);
    assert!(h.store.latest_active("status").unwrap().is_none());
}

#[tokio::test]
async fn up_without_prior_down_sends_nothing() {
    let h = Harness::new();
    h.add_rule("status", "Status", 0.0, 1);
    let up = h.set_status("s1", SystemStatus::Up);
    h.engine.handle_status_change(&up, Utc::now()).await.unwrap();
    assert!(h.sink.all().is_empty());
}

#[tokio::test]
async fn force_expire_makes_pending_alerts_fire() {
    let h = Harness::new();
    h.add_rule("status", "Status", 0.0, 30);
    let t0 = Utc::now();

    let down = h.set_status("s1", SystemStatus::Down);
    h.engine.handle_status_change(&down, t0).await.unwrap();
    assert_eq!(h.engine.flush_pending_status(t0).await.unwrap(), 0);

    assert_eq!(h.engine.force_expire_pending_status(t0).await.unwrap(), 1);
    assert_eq!(h.engine.flush_pending_status(t0).await.unwrap(), 1);
    assert_eq!(h.sink.all().len(), 1);
}

#[tokio::test]
async fn reconcile_resolves_recovered_and_reschedules_down() {
    let h = Harness::new();
    let t0 = Utc::now();

    // s1 is up but its status rule is still triggered from before a restart.
    let mut stale = h.add_rule("status-up", "Status", 0.0, 1);
    stale.triggered = true;
    h.store.save_rule(&stale).unwrap();

    h.set_status("s2", SystemStatus::Down);
    h.add_rule_on("s2", "status-down", "Status", 0.0, 2, |_| {});

    assert_eq!(h.engine.reconcile(t0).await.unwrap(), 2);
    assert_eq!(h.sink.titles(), vec!["Connection to web-01 is up ✅"]);
    assert_eq!(h.engine.status_scheduler().pending_count().await.unwrap(), 1);

    assert_eq!(
        h.engine
            .flush_pending_status(t0 + Duration::minutes(2))
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.sink.titles()[1], "Connection to host-s2 is down 🔴");
}

#[tokio::test]
async fn status_worker_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let (tx, rx) = watch::channel(false);
    let (engine, worker) = AlertEngine::start(store, sink, EngineConfig::default(), rx);

    tx.send(true).unwrap();
    worker.await.unwrap();
    assert!(engine.flush_pending_status(Utc::now()).await.is_err());
}

// ---- interleaved writers ----

type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

/// Runs a hook right after the next `list_rules` returns, standing in for
/// another task writing between a read and the write that follows it.
#[derive(Default)]
struct InterleavedStore {
    inner: MemoryStore,
    after_list: Mutex<Option<Hook>>,
}

impl InterleavedStore {
    fn after_next_list(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.after_list.lock().unwrap() = Some(Box::new(hook));
    }
}

impl RuleStore for InterleavedStore {
    fn get_rule(&self, id: &str) -> anyhow::Result<Option<AlertRule>> {
        self.inner.get_rule(id)
    }

    fn list_rules(&self, filter: &RuleFilter) -> anyhow::Result<Vec<AlertRule>> {
        let rules = self.inner.list_rules(filter)?;
        let hook = self.after_list.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        Ok(rules)
    }

    fn save_rule(&self, rule: &AlertRule) -> anyhow::Result<()> {
        self.inner.save_rule(rule)
    }

    fn record_repeat(&self, id: &str, expected_count: u32, sent_at: DateTime<Utc>) -> anyhow::Result<bool> {
        self.inner.record_repeat(id, expected_count, sent_at)
    }

    fn upsert_rules(&self, rules: &[AlertRule], overwrite: bool) -> anyhow::Result<UpsertOutcome> {
        self.inner.upsert_rules(rules, overwrite)
    }

    fn delete_rules(&self, user_id: &str, name: &str, system_ids: &[String]) -> anyhow::Result<usize> {
        self.inner.delete_rules(user_id, name, system_ids)
    }
}

impl SnapshotStore for InterleavedStore {
    fn insert_snapshot(&self, snapshot: &MetricSnapshot) -> anyhow::Result<i64> {
        self.inner.insert_snapshot(snapshot)
    }

    fn query_snapshots(
        &self,
        system_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MetricSnapshot>> {
        self.inner.query_snapshots(system_id, from, to)
    }

    fn snapshots_after(&self, after: i64, limit: usize) -> anyhow::Result<Vec<(i64, MetricSnapshot)>> {
        self.inner.snapshots_after(after, limit)
    }

    fn latest_sequence(&self) -> anyhow::Result<i64> {
        self.inner.latest_sequence()
    }
}

impl HistoryStore for InterleavedStore {
    fn create_history(&self, entry: &AlertHistoryEntry) -> anyhow::Result<()> {
        self.inner.create_history(entry)
    }

    fn latest_active(&self, alert_id: &str) -> anyhow::Result<Option<AlertHistoryEntry>> {
        self.inner.latest_active(alert_id)
    }

    fn update_history(&self, entry: &AlertHistoryEntry) -> anyhow::Result<()> {
        self.inner.update_history(entry)
    }

    fn list_history(&self, alert_id: &str) -> anyhow::Result<Vec<AlertHistoryEntry>> {
        self.inner.list_history(alert_id)
    }

    fn delete_solved_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        self.inner.delete_solved_before(cutoff)
    }
}

impl SystemStore for InterleavedStore {
    fn get_system(&self, id: &str) -> anyhow::Result<Option<SystemRecord>> {
        self.inner.get_system(id)
    }

    fn list_systems(&self) -> anyhow::Result<Vec<SystemRecord>> {
        self.inner.list_systems()
    }

    fn upsert_system(&self, system: &SystemRecord) -> anyhow::Result<()> {
        self.inner.upsert_system(system)
    }
}

impl UserSettingsStore for InterleavedStore {
    fn get_user_settings(&self, user_id: &str) -> anyhow::Result<Option<UserNotificationSettings>> {
        self.inner.get_user_settings(user_id)
    }

    fn save_user_settings(&self, settings: &UserNotificationSettings) -> anyhow::Result<()> {
        self.inner.save_user_settings(settings)
    }
}

struct InterleavedHarness {
    store: Arc<InterleavedStore>,
    sink: Arc<RecordingSink>,
    engine: AlertEngine,
    _shutdown: watch::Sender<bool>,
}

impl InterleavedHarness {
    fn new(status: SystemStatus) -> Self {
        let store = Arc::new(InterleavedStore::default());
        store
            .upsert_system(&SystemRecord {
                id: "s1".into(),
                name: "web-01".into(),
                users: vec!["u1".into()],
                status,
            })
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = EngineConfig {
            app_url: "https://vigil.example.com".into(),
            status_scan_interval: std::time::Duration::from_secs(3600),
        };
        let (engine, _worker) = AlertEngine::start(store.clone(), sink.clone(), config, shutdown_rx);
        Self {
            store,
            sink,
            engine,
            _shutdown: shutdown_tx,
        }
    }

    fn add_rule(&self, id: &str, name: &str, tweak: impl FnOnce(&mut AlertRule)) {
        let now = Utc::now();
        let mut rule = AlertRule {
            id: id.into(),
            user_id: "u1".into(),
            system_id: "s1".into(),
            name: name.into(),
            filesystem: None,
            threshold: 80.0,
            min_duration_minutes: 1,
            triggered: false,
            repeat_interval_minutes: 0,
            max_repeats: 0,
            repeat_count: 0,
            last_sent: None,
            created_at: now,
            updated_at: now,
        };
        tweak(&mut rule);
        self.store.upsert_rules(&[rule], false).unwrap();
    }

    fn rule(&self, id: &str) -> AlertRule {
        self.store.get_rule(id).unwrap().unwrap()
    }
}

fn set_triggered(store: &MemoryStore, id: &str, triggered: bool) {
    let mut rule = store.get_rule(id).unwrap().unwrap();
    rule.triggered = triggered;
    rule.reset_repeats();
    store.save_rule(&rule).unwrap();
}

#[tokio::test]
async fn repeat_does_not_revive_rule_cleared_after_scan() {
    let h = InterleavedHarness::new(SystemStatus::Up);
    h.add_rule("cpu", "CPU", |r| {
        r.triggered = true;
        r.repeat_interval_minutes = 5;
        r.max_repeats = 3;
    });

    h.store.after_next_list(|inner| set_triggered(inner, "cpu", false));
    let repeats = h.engine.repeat_scheduler();
    assert_eq!(repeats.tick(Utc::now() + Duration::minutes(10)).unwrap(), 0);

    let rule = h.rule("cpu");
    assert!(!rule.triggered);
    assert_eq!(rule.repeat_count, 0);
    assert!(h.sink.all().is_empty());
}

#[tokio::test]
async fn up_after_down_fired_concurrently_sends_recovery() {
    let h = InterleavedHarness::new(SystemStatus::Up);
    h.add_rule("status", "Status", |_| {});

    // The debounce worker fires "down" while the status change is handled.
    h.store.after_next_list(|inner| set_triggered(inner, "status", true));
    let up = h.store.get_system("s1").unwrap().unwrap();
    h.engine.handle_status_change(&up, Utc::now()).await.unwrap();

    assert_eq!(h.sink.titles(), vec!["Connection to web-01 is up ✅"]);
    assert!(!h.rule("status").triggered);
}
