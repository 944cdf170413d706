//! Drives the alert engine from the store.
//!
//! Agents write snapshots and system status into the database. The feed
//! picks up snapshots by sequence number and diffs system statuses between
//! polls, handing both to the [`AlertEngine`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vigil_alert::AlertEngine;
use vigil_common::types::SystemStatus;
use vigil_storage::Store;

/// Snapshots read per query.
const SNAPSHOT_BATCH: usize = 500;

pub struct Feed {
    store: Arc<dyn Store>,
    engine: Arc<AlertEngine>,
    cursor: i64,
    statuses: HashMap<String, SystemStatus>,
}

impl Feed {
    /// Starts after the newest stored snapshot with the current statuses
    /// as baseline. Anything older is covered by engine reconciliation.
    pub fn new(store: Arc<dyn Store>, engine: Arc<AlertEngine>) -> Result<Self> {
        let cursor = store.latest_sequence()?;
        let statuses = store
            .list_systems()?
            .into_iter()
            .map(|s| (s.id, s.status))
            .collect();
        Ok(Self {
            store,
            engine,
            cursor,
            statuses,
        })
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Evaluates every snapshot stored since the last poll. Returns how
    /// many snapshots were consumed.
    pub fn poll_snapshots(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut consumed = 0;
        loop {
            let batch = self.store.snapshots_after(self.cursor, SNAPSHOT_BATCH)?;
            let len = batch.len();
            for (seq, snapshot) in batch {
                self.cursor = seq;
                consumed += 1;
                let system = match self.store.get_system(&snapshot.system_id) {
                    Ok(Some(system)) => system,
                    Ok(None) => {
                        tracing::debug!(system_id = %snapshot.system_id, seq, "Snapshot for unknown system, skipping");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(system_id = %snapshot.system_id, error = %e, "Failed to load system");
                        continue;
                    }
                };
                match self.engine.handle_snapshot(&system, &snapshot, now) {
                    Ok(0) => {}
                    Ok(transitions) => {
                        tracing::debug!(system = %system.name, transitions, "Snapshot evaluated")
                    }
                    Err(e) => {
                        tracing::error!(system = %system.name, seq, error = %e, "Snapshot evaluation failed")
                    }
                }
            }
            if len < SNAPSHOT_BATCH {
                break;
            }
        }
        Ok(consumed)
    }

    /// Forwards status changes since the last poll, including systems seen
    /// for the first time. Returns how many changes were forwarded.
    pub async fn poll_statuses(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let systems = self.store.list_systems()?;
        let mut seen = HashMap::with_capacity(systems.len());
        let mut changed = 0;

        for system in systems {
            seen.insert(system.id.clone(), system.status);
            if self.statuses.get(&system.id) == Some(&system.status) {
                continue;
            }
            tracing::info!(system = %system.name, status = %system.status, "System status changed");
            if let Err(e) = self.engine.handle_status_change(&system, now).await {
                tracing::error!(system = %system.name, error = %e, "Status change handling failed");
            }
            changed += 1;
        }

        self.statuses = seen;
        Ok(changed)
    }

    /// Polls every `period` until `shutdown` flips.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(period_secs = period.as_secs(), cursor = self.cursor, "Snapshot feed started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.poll_statuses(now).await {
                        tracing::error!(error = %e, "Status poll failed");
                    }
                    if let Err(e) = self.poll_snapshots(now) {
                        tracing::error!(error = %e, "Snapshot poll failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Snapshot feed stopped");
    }
}
