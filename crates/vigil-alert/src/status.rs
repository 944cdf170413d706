//! Debounce of "down" notifications for status rules.
//!
//! A single worker task owns the map of pending alerts. Every change goes
//! through its command channel, and the periodic expiry scan runs on the
//! same task, so there is no shared mutable state.

use crate::engine::Context;
use crate::error::{AlertError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;

/// A delayed "down" notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStatusAlert {
    pub rule_id: String,
    pub system_name: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingStatusAlert {
    /// Pending alert expiring after the rule's window, at least one minute.
    pub fn new(rule_id: &str, system_name: &str, min_duration_minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            system_name: system_name.to_string(),
            expires_at: now + Duration::minutes(i64::from(min_duration_minutes.max(1))),
        }
    }
}

enum Command {
    Schedule {
        pending: PendingStatusAlert,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        rule_id: String,
        reply: oneshot::Sender<bool>,
    },
    Flush {
        now: DateTime<Utc>,
        reply: oneshot::Sender<usize>,
    },
    ForceExpire {
        now: DateTime<Utc>,
        reply: oneshot::Sender<usize>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the debounce worker.
#[derive(Clone)]
pub struct StatusScheduler {
    tx: mpsc::Sender<Command>,
}

impl StatusScheduler {
    /// Spawns the worker. It scans for expired entries every `scan_interval`
    /// and exits when `shutdown` flips or every handle is dropped.
    pub(crate) fn start(
        ctx: Arc<Context>,
        scan_interval: std::time::Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let worker = StatusWorker {
            ctx,
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(rx, scan_interval, shutdown));
        (Self { tx }, handle)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| AlertError::WorkerStopped)?;
        rx.await.map_err(|_| AlertError::WorkerStopped)
    }

    /// Starts the grace period for a rule. Returns `false` when the rule
    /// already has one running.
    pub async fn schedule(&self, pending: PendingStatusAlert) -> Result<bool> {
        self.request(|reply| Command::Schedule { pending, reply })
            .await
    }

    /// Drops the pending alert of a rule. Returns `true` if one existed.
    pub async fn cancel(&self, rule_id: &str) -> Result<bool> {
        let rule_id = rule_id.to_string();
        self.request(|reply| Command::Cancel { rule_id, reply }).await
    }

    /// Fires every pending alert that has expired by `now`. Returns how many
    /// fired.
    pub async fn flush(&self, now: DateTime<Utc>) -> Result<usize> {
        self.request(|reply| Command::Flush { now, reply }).await
    }

    /// Moves every pending expiry to `now` so the next scan or flush fires
    /// them. Returns how many were changed.
    pub async fn force_expire(&self, now: DateTime<Utc>) -> Result<usize> {
        self.request(|reply| Command::ForceExpire { now, reply })
            .await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.request(|reply| Command::Len { reply }).await
    }
}

struct StatusWorker {
    ctx: Arc<Context>,
    pending: HashMap<String, PendingStatusAlert>,
}

impl StatusWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        scan_interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            scan_secs = scan_interval.as_secs(),
            "Status debounce worker started"
        );

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.fire_expired(Utc::now());
                }
                _ = shutdown.changed() => break,
            }
        }

        if !self.pending.is_empty() {
            tracing::info!(
                pending = self.pending.len(),
                "Status debounce worker stopped, discarding pending alerts"
            );
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Schedule { pending, reply } => {
                let created = !self.pending.contains_key(&pending.rule_id);
                if created {
                    tracing::debug!(
                        rule_id = %pending.rule_id,
                        system = %pending.system_name,
                        expires_at = %pending.expires_at,
                        "Status alert pending"
                    );
                    self.pending.insert(pending.rule_id.clone(), pending);
                }
                let _ = reply.send(created);
            }
            Command::Cancel { rule_id, reply } => {
                let cancelled = self.pending.remove(&rule_id).is_some();
                if cancelled {
                    tracing::debug!(rule_id = %rule_id, "Pending status alert cancelled");
                }
                let _ = reply.send(cancelled);
            }
            Command::Flush { now, reply } => {
                let _ = reply.send(self.fire_expired(now));
            }
            Command::ForceExpire { now, reply } => {
                for pending in self.pending.values_mut() {
                    pending.expires_at = now;
                }
                let _ = reply.send(self.pending.len());
            }
            Command::Len { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn fire_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.expires_at <= now)
            .map(|p| p.rule_id.clone())
            .collect();

        let mut fired = 0;
        for rule_id in expired {
            let Some(pending) = self.pending.remove(&rule_id) else {
                continue;
            };
            match self.ctx.fire_status_down(&pending, now) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        rule_id = %pending.rule_id,
                        system = %pending.system_name,
                        error = %e,
                        "Failed to fire status alert, retrying on next scan"
                    );
                    self.pending.insert(rule_id, pending);
                }
            }
        }
        fired
    }
}
