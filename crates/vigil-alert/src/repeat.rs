use crate::engine::Context;
use crate::error::Result;
use crate::message;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use vigil_common::metric::AlertKind;
use vigil_common::types::AlertRule;
use vigil_storage::{RuleFilter, RuleStore, SystemStore};

/// Whether a triggered rule owes a repeat notification at `now`.
///
/// The first repeat is due on the first tick after the trigger; later ones
/// wait `repeat_interval_minutes` after the previous repeat.
pub fn is_due(rule: &AlertRule, now: DateTime<Utc>) -> bool {
    if !rule.triggered || rule.repeat_interval_minutes == 0 {
        return false;
    }
    if rule.max_repeats > 0 && rule.repeat_count >= rule.max_repeats {
        return false;
    }
    rule.last_sent
        .is_none_or(|sent| now >= sent + Duration::minutes(i64::from(rule.repeat_interval_minutes)))
}

/// Re-notifies for rules that stay triggered.
pub struct RepeatScheduler {
    ctx: Arc<Context>,
}

impl RepeatScheduler {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Sends every repeat that is due at `now`. Returns how many were sent.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let rules = self.ctx.store.list_rules(&RuleFilter {
            triggered: Some(true),
            ..Default::default()
        })?;

        let mut sent = 0;
        for mut rule in rules {
            if !is_due(&rule, now) {
                continue;
            }
            let kind = match AlertKind::from_name(&rule.name) {
                Some(AlertKind::Metric(kind)) => Some(kind),
                Some(AlertKind::Status) => None,
                None => {
                    tracing::warn!(rule_id = %rule.id, name = %rule.name, "Skipping repeat for unknown alert name");
                    continue;
                }
            };
            let system_name = match self.ctx.store.get_system(&rule.system_id) {
                Ok(Some(system)) => system.name,
                Ok(None) => {
                    tracing::debug!(rule_id = %rule.id, system_id = %rule.system_id, "System gone, skipping repeat");
                    continue;
                }
                Err(e) => {
                    tracing::error!(rule_id = %rule.id, error = %e, "Failed to load system for repeat");
                    continue;
                }
            };

            match self.ctx.store.record_repeat(&rule.id, rule.repeat_count, now) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(rule_id = %rule.id, "Rule changed since the scan, skipping repeat");
                    continue;
                }
                Err(e) => {
                    tracing::error!(rule_id = %rule.id, error = %e, "Failed to save repeat state");
                    continue;
                }
            }
            rule.repeat_count += 1;
            rule.last_sent = Some(now);
            rule.updated_at = now;

            let link = self.ctx.link(&system_name);
            self.ctx
                .sink
                .notify(message::repeat_notification(&rule, kind, &system_name, &link));
            tracing::debug!(rule_id = %rule.id, repeat = rule.repeat_count, "Repeat notification queued");
            sent += 1;
        }
        Ok(sent)
    }

    /// Ticks every `period` until `shutdown` flips.
    pub async fn run(self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(period_secs = period.as_secs(), "Repeat scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()) {
                        Ok(0) => {}
                        Ok(sent) => tracing::info!(sent, "Repeat notifications sent"),
                        Err(e) => tracing::error!(error = %e, "Repeat scan failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Repeat scheduler stopped");
    }
}
