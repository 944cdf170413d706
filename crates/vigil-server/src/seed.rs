//! Rule seed files for the `init-rules` and `delete-rules` subcommands.
//!
//! ```json
//! {
//!   "user_id": "u1",
//!   "systems": [{ "id": "s1", "name": "web-01", "users": ["u1"], "status": "up" }],
//!   "rules": [{ "name": "CPU", "threshold": 80, "min_duration_minutes": 5, "systems": ["s1"] }]
//! }
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use vigil_common::types::SystemRecord;
use vigil_storage::bulk::{self, BulkDeleteRequest, BulkUpsertRequest, KeyedLocks};
use vigil_storage::{RuleStore, SystemStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesSeedFile {
    /// Owner of every rule in the file.
    pub user_id: String,
    /// Registered before any rule is applied, unless a system with the
    /// same id already exists.
    #[serde(default)]
    pub systems: Vec<SystemRecord>,
    #[serde(default)]
    pub rules: Vec<BulkUpsertRequest>,
}

impl RulesSeedFile {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", path, e))?;
        let seed: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", path, e))?;
        Ok(seed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub removed: usize,
    /// Requests rejected as a whole, e.g. for a foreign system.
    pub failed: usize,
}

/// Registers the seed's unknown systems and upserts each rule request.
/// Existing systems keep their stored owners and status. A rejected
/// request is logged and does not stop the others.
pub async fn apply_rules<S>(store: &S, locks: &KeyedLocks, seed: &RulesSeedFile) -> Result<SeedSummary>
where
    S: RuleStore + SystemStore,
{
    for system in &seed.systems {
        if store.get_system(&system.id)?.is_some() {
            tracing::warn!(system_id = %system.id, "System already registered, leaving it unchanged");
            continue;
        }
        store.upsert_system(system)?;
        tracing::info!(system_id = %system.id, name = %system.name, "System registered");
    }

    let mut summary = SeedSummary::default();
    for request in &seed.rules {
        match bulk::upsert_rules(store, store, locks, &seed.user_id, request).await {
            Ok(outcome) => {
                summary.created += outcome.created;
                summary.updated += outcome.updated;
                summary.skipped += outcome.skipped;
            }
            Err(e) => {
                tracing::error!(name = %request.name, error = %e, "Rule seed request rejected");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Deletes the rules a seed file would create. Systems are left alone.
pub async fn remove_rules<S>(store: &S, locks: &KeyedLocks, seed: &RulesSeedFile) -> SeedSummary
where
    S: RuleStore + SystemStore,
{
    let mut summary = SeedSummary::default();
    for request in &seed.rules {
        let delete = BulkDeleteRequest {
            name: request.name.clone(),
            systems: request.systems.clone(),
        };
        match bulk::delete_rules(store, store, locks, &seed.user_id, &delete).await {
            Ok(removed) => summary.removed += removed,
            Err(e) => {
                tracing::error!(name = %request.name, error = %e, "Rule delete request rejected");
                summary.failed += 1;
            }
        }
    }
    summary
}
