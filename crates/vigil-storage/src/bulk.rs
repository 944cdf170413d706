//! Bulk alert-rule mutations: apply one rule definition to many systems.
//!
//! Every target system is checked against the requesting user before any
//! write happens, so a request either applies to all of its systems or to
//! none. Concurrent bulk requests touching the same
//! `(user, system, name)` tuple are serialised through [`KeyedLocks`].

use crate::error::{Result, StorageError};
use crate::{RuleStore, SystemStore, UpsertOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use vigil_common::metric::{AlertKind, MetricKind};
use vigil_common::types::AlertRule;

/// Lock key for one rule target.
pub type RuleKey = (String, String, String);

/// Applies one rule definition to a list of systems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUpsertRequest {
    pub name: String,
    pub threshold: f64,
    #[serde(default = "default_min_duration")]
    pub min_duration_minutes: u32,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub repeat_interval_minutes: u32,
    #[serde(default)]
    pub max_repeats: u32,
    pub systems: Vec<String>,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_min_duration() -> u32 {
    1
}

/// Removes the rule named `name` from a list of systems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDeleteRequest {
    pub name: String,
    pub systems: Vec<String>,
}

/// Per-key async mutexes. Entries are dropped again once no guard or
/// waiter references them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<RuleKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Holds every lock acquired by [`KeyedLocks::lock_all`].
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the locks for `keys` in sorted order so two overlapping
    /// requests can never wait on each other in a cycle.
    pub async fn lock_all(&self, mut keys: Vec<RuleKey>) -> KeyedGuard<'_> {
        keys.sort();
        keys.dedup();
        let mutexes: Vec<_> = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            keys.into_iter()
                .map(|key| locks.entry(key).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        KeyedGuard {
            owner: self,
            guards,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        self.owner.prune();
    }
}

/// Rejects the request unless every system exists and lists `user_id`
/// among its users.
fn authorize(systems: &dyn SystemStore, user_id: &str, system_ids: &[String]) -> Result<()> {
    for system_id in system_ids {
        let system = systems
            .get_system(system_id)?
            .ok_or_else(|| StorageError::NotFound {
                entity: "system",
                id: system_id.clone(),
            })?;
        if !system.is_owned_by(user_id) {
            return Err(StorageError::Forbidden {
                user_id: user_id.to_string(),
                system_id: system_id.clone(),
            });
        }
    }
    Ok(())
}

fn lock_keys(user_id: &str, name: &str, system_ids: &[String]) -> Vec<RuleKey> {
    system_ids
        .iter()
        .map(|s| (user_id.to_string(), s.clone(), name.to_string()))
        .collect()
}

/// Creates one rule per target system, or updates existing ones when
/// `overwrite` is set.
pub async fn upsert_rules(
    rules: &dyn RuleStore,
    systems: &dyn SystemStore,
    locks: &KeyedLocks,
    user_id: &str,
    request: &BulkUpsertRequest,
) -> Result<UpsertOutcome> {
    let kind = AlertKind::from_name(&request.name)
        .ok_or_else(|| StorageError::UnknownAlertName(request.name.clone()))?;
    authorize(systems, user_id, &request.systems)?;

    let filesystem = match kind {
        AlertKind::Metric(MetricKind::Disk) => request.filesystem.clone(),
        _ => None,
    };

    let _guard = locks
        .lock_all(lock_keys(user_id, &request.name, &request.systems))
        .await;

    let now = Utc::now();
    let batch: Vec<AlertRule> = request
        .systems
        .iter()
        .map(|system_id| AlertRule {
            id: vigil_common::id::next_id(),
            user_id: user_id.to_string(),
            system_id: system_id.clone(),
            name: request.name.clone(),
            filesystem: filesystem.clone(),
            threshold: request.threshold,
            min_duration_minutes: request.min_duration_minutes,
            triggered: false,
            repeat_interval_minutes: request.repeat_interval_minutes,
            max_repeats: request.max_repeats,
            repeat_count: 0,
            last_sent: None,
            created_at: now,
            updated_at: now,
        })
        .collect();

    let outcome = rules.upsert_rules(&batch, request.overwrite)?;
    tracing::info!(
        user_id,
        name = %request.name,
        created = outcome.created,
        updated = outcome.updated,
        skipped = outcome.skipped,
        "Bulk alert upsert applied"
    );
    Ok(outcome)
}

/// Deletes the named rule from every target system. Returns how many rules
/// actually existed and were removed.
pub async fn delete_rules(
    rules: &dyn RuleStore,
    systems: &dyn SystemStore,
    locks: &KeyedLocks,
    user_id: &str,
    request: &BulkDeleteRequest,
) -> Result<usize> {
    authorize(systems, user_id, &request.systems)?;

    let _guard = locks
        .lock_all(lock_keys(user_id, &request.name, &request.systems))
        .await;

    let removed = rules.delete_rules(user_id, &request.name, &request.systems)?;
    tracing::info!(user_id, name = %request.name, removed, "Bulk alert delete applied");
    Ok(removed)
}
