use crate::error::Result;
use crate::history::HistoryRecorder;
use crate::hysteresis::{self, Transition};
use crate::message::{self, SystemLink};
use crate::repeat::RepeatScheduler;
use crate::status::{PendingStatusAlert, StatusScheduler};
use crate::window::{self, Aggregate, AveragingWindow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vigil_common::metric::{AlertKind, MetricKind, STATUS_ALERT_NAME};
use vigil_common::types::{AlertRule, MetricSnapshot, SystemRecord, SystemStatus};
use vigil_notify::NotificationSink;
use vigil_storage::{RuleFilter, RuleStore, SnapshotStore, Store, SystemStore};

/// Runtime settings of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL used for links in notifications.
    pub app_url: String,
    /// How often the debounce worker looks for expired status alerts.
    pub status_scan_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_url: "http://localhost:8090".to_string(),
            status_scan_interval: Duration::from_secs(15),
        }
    }
}

/// State shared by the engine, the debounce worker and the repeat
/// scheduler. Every method here is synchronous and never waits on delivery.
pub(crate) struct Context {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    history: HistoryRecorder,
    app_url: String,
}

impl Context {
    pub(crate) fn link(&self, system_name: &str) -> SystemLink {
        SystemLink::new(&self.app_url, system_name)
    }

    /// Persists a flipped rule together with its history entry. If the
    /// history write fails the rule is restored, so the next evaluation
    /// sees the old state and tries again. Nothing is notified on error.
    fn commit_transition(
        &self,
        rule: &AlertRule,
        triggered: bool,
        value: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<AlertRule> {
        let mut updated = rule.clone();
        updated.triggered = triggered;
        updated.reset_repeats();
        updated.updated_at = now;
        self.store.save_rule(&updated)?;

        let recorded = if triggered {
            self.history.open(&updated, value, now).map(|_| ())
        } else {
            self.history.resolve(&updated, now).map(|_| ())
        };
        if let Err(e) = recorded {
            if let Err(restore) = self.store.save_rule(rule) {
                tracing::error!(rule_id = %rule.id, error = %restore, "Failed to restore rule after history error");
            }
            return Err(anyhow::anyhow!("failed to record alert history: {e}"));
        }
        Ok(updated)
    }

    fn apply_threshold(
        &self,
        rule: &AlertRule,
        kind: MetricKind,
        system_name: &str,
        transition: Transition,
        aggregate: &Aggregate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(peak) = aggregate.peak() else {
            return Ok(());
        };
        let triggered = match transition {
            Transition::Trigger => true,
            Transition::Clear => false,
            Transition::None => return Ok(()),
        };

        let updated = self.commit_transition(rule, triggered, peak.value, now)?;

        let link = self.link(system_name);
        if triggered {
            // Legacy disk rules report every filesystem over the threshold.
            for reading in aggregate.readings.iter().filter(|r| r.value > rule.threshold) {
                self.sink.notify(message::threshold_notification(
                    &updated,
                    kind,
                    system_name,
                    reading.key.as_deref(),
                    reading.value,
                    true,
                    &link,
                ));
            }
        } else {
            self.sink.notify(message::threshold_notification(
                &updated,
                kind,
                system_name,
                peak.key.as_deref(),
                peak.value,
                false,
                &link,
            ));
        }

        tracing::info!(
            rule_id = %rule.id,
            system = %system_name,
            alert = %kind,
            value = peak.value,
            threshold = rule.threshold,
            triggered,
            "Alert state changed"
        );
        Ok(())
    }

    /// Fires an expired "down" alert. Returns `false` when it no longer
    /// applies (rule gone, already triggered or system back up).
    pub(crate) fn fire_status_down(&self, pending: &PendingStatusAlert, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(rule) = self.store.get_rule(&pending.rule_id)? else {
            tracing::debug!(rule_id = %pending.rule_id, "Status rule deleted while pending");
            return Ok(false);
        };
        if rule.triggered {
            return Ok(false);
        }
        if let Some(system) = self.store.get_system(&rule.system_id)? {
            if system.status != SystemStatus::Down {
                tracing::debug!(rule_id = %rule.id, system = %system.name, "System recovered before expiry");
                return Ok(false);
            }
        }

        let updated = self.commit_transition(&rule, true, 0.0, now)?;
        let link = self.link(&pending.system_name);
        self.sink.notify(message::status_notification(&updated, &pending.system_name, true, &link));
        tracing::info!(rule_id = %rule.id, system = %pending.system_name, "System down alert sent");
        Ok(true)
    }

    /// Sends the "up" notification for a status rule whose "down" was
    /// delivered. Returns `false` when the rule is not triggered.
    pub(crate) fn resolve_status(&self, rule: &AlertRule, system_name: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        if !rule.triggered {
            return Ok(false);
        }
        let updated = self.commit_transition(rule, false, 0.0, now)?;
        let link = self.link(system_name);
        self.sink.notify(message::status_notification(&updated, system_name, false, &link));
        tracing::info!(rule_id = %rule.id, system = %system_name, "System up alert sent");
        Ok(true)
    }
}

/// Evaluates alert rules against incoming snapshots and status changes.
pub struct AlertEngine {
    ctx: Arc<Context>,
    status: StatusScheduler,
}

impl AlertEngine {
    /// Builds the engine and spawns its status debounce worker, which stops
    /// when `shutdown` flips.
    pub fn start<S: Store + 'static>(
        store: Arc<S>,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let ctx = Arc::new(Context {
            store: store.clone(),
            sink,
            history: HistoryRecorder::new(store),
            app_url: config.app_url,
        });
        let (status, handle) = StatusScheduler::start(ctx.clone(), config.status_scan_interval, shutdown);
        (Self { ctx, status }, handle)
    }

    pub fn status_scheduler(&self) -> &StatusScheduler {
        &self.status
    }

    pub fn repeat_scheduler(&self) -> RepeatScheduler {
        RepeatScheduler::new(self.ctx.clone())
    }

    /// Evaluates every metric rule of `system` after `snapshot` arrived.
    ///
    /// Rules with a window longer than one minute are averaged over stored
    /// snapshots; a failed snapshot query skips those rules for this cycle.
    /// Returns the number of transitions applied.
    pub fn handle_snapshot(
        &self,
        system: &SystemRecord,
        snapshot: &MetricSnapshot,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if system.status == SystemStatus::Paused {
            return Ok(0);
        }

        let rules = self.ctx.store.list_rules(&RuleFilter {
            system_id: Some(system.id.clone()),
            name_ne: Some(STATUS_ALERT_NAME.to_string()),
            ..Default::default()
        })?;
        let rules: Vec<(AlertRule, MetricKind)> = rules
            .into_iter()
            .filter_map(|rule| match AlertKind::from_name(&rule.name) {
                Some(AlertKind::Metric(kind)) => Some((rule, kind)),
                _ => {
                    tracing::warn!(rule_id = %rule.id, name = %rule.name, "Skipping rule with unknown alert name");
                    None
                }
            })
            .collect();

        let longest = rules
            .iter()
            .map(|(rule, _)| rule.min_duration_minutes)
            .filter(|&m| m > 1)
            .max();
        let history = match longest {
            Some(minutes) => self.load_window(system, snapshot, minutes, now),
            None => None,
        };

        let mut transitions = 0;
        for (rule, kind) in &rules {
            let aggregate = if rule.min_duration_minutes <= 1 {
                window::instant(rule, *kind, snapshot)
            } else {
                let Some(history) = &history else {
                    continue;
                };
                let aggregate = window::aggregate(rule, *kind, history, now);
                let window = AveragingWindow::ending_at(now, rule.min_duration_minutes);
                if !window.has_coverage(aggregate.coverage) {
                    tracing::debug!(
                        rule_id = %rule.id,
                        coverage = aggregate.coverage,
                        minutes = window.minutes(),
                        "Not enough snapshots in window"
                    );
                    continue;
                }
                aggregate
            };

            let Some(peak) = aggregate.peak() else {
                continue;
            };
            let transition = hysteresis::evaluate_rule(rule, peak.value);
            if transition == Transition::None {
                continue;
            }

            match self.ctx.apply_threshold(rule, *kind, &system.name, transition, &aggregate, now) {
                Ok(()) => transitions += 1,
                Err(e) => tracing::error!(
                    rule_id = %rule.id,
                    system = %system.name,
                    error = %e,
                    "Failed to apply alert transition"
                ),
            }
        }
        Ok(transitions)
    }

    fn load_window(
        &self,
        system: &SystemRecord,
        latest: &MetricSnapshot,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Option<Vec<MetricSnapshot>> {
        let (from, to) = AveragingWindow::ending_at(now, minutes).query_range();
        match self.ctx.store.query_snapshots(&system.id, from, to) {
            Ok(mut snapshots) => {
                if !snapshots.iter().any(|s| s.created_at == latest.created_at) {
                    snapshots.push(latest.clone());
                }
                Some(snapshots)
            }
            Err(e) => {
                tracing::warn!(
                    system = %system.name,
                    error = %e,
                    "Snapshot query failed, skipping windowed rules"
                );
                None
            }
        }
    }

    /// Reacts to a system changing status. "Down" starts the debounce of
    /// each status rule; "up" cancels it or, if the down alert already
    /// fired, sends the recovery notification.
    pub async fn handle_status_change(&self, system: &SystemRecord, now: DateTime<Utc>) -> Result<()> {
        let rules = self.ctx.store.list_rules(&RuleFilter {
            system_id: Some(system.id.clone()),
            name: Some(STATUS_ALERT_NAME.to_string()),
            ..Default::default()
        })?;

        for rule in rules {
            match system.status {
                SystemStatus::Down => {
                    if !rule.triggered {
                        let pending = PendingStatusAlert::new(&rule.id, &system.name, rule.min_duration_minutes, now);
                        self.status.schedule(pending).await?;
                    }
                }
                SystemStatus::Up => {
                    if self.status.cancel(&rule.id).await? {
                        continue;
                    }
                    // The worker may have fired "down" since the rules were listed.
                    let Some(current) = self.ctx.store.get_rule(&rule.id)? else {
                        continue;
                    };
                    if let Err(e) = self.ctx.resolve_status(&current, &system.name, now) {
                        tracing::error!(rule_id = %rule.id, system = %system.name, error = %e, "Failed to resolve status alert");
                    }
                }
                SystemStatus::Paused => {
                    self.status.cancel(&rule.id).await?;
                }
                SystemStatus::Pending => {}
            }
        }
        Ok(())
    }

    /// Brings status rules in line with current system states after a
    /// restart: recovered systems get their "up" notification, systems
    /// still down get a fresh grace period. Returns how many rules were
    /// acted on.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<usize> {
        let rules = self.ctx.store.list_rules(&RuleFilter {
            name: Some(STATUS_ALERT_NAME.to_string()),
            ..Default::default()
        })?;

        let mut acted = 0;
        for rule in rules {
            let Some(system) = self.ctx.store.get_system(&rule.system_id)? else {
                continue;
            };
            match (system.status, rule.triggered) {
                (SystemStatus::Up, true) => match self.ctx.resolve_status(&rule, &system.name, now) {
                    Ok(true) => acted += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!(rule_id = %rule.id, error = %e, "Failed to resolve status alert"),
                },
                (SystemStatus::Down, false) => {
                    let pending = PendingStatusAlert::new(&rule.id, &system.name, rule.min_duration_minutes, now);
                    if self.status.schedule(pending).await? {
                        acted += 1;
                    }
                }
                _ => {}
            }
        }
        if acted > 0 {
            tracing::info!(rules = acted, "Reconciled status alerts");
        }
        Ok(acted)
    }

    /// Fires pending status alerts that have expired by `now`.
    pub async fn flush_pending_status(&self, now: DateTime<Utc>) -> Result<usize> {
        self.status.flush(now).await
    }

    /// Marks every pending status alert as expired at `now`.
    pub async fn force_expire_pending_status(&self, now: DateTime<Utc>) -> Result<usize> {
        self.status.force_expire(now).await
    }
}
