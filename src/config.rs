use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for the execution core.
///
/// Durations are milliseconds. TTLs are enforced by the maintenance sweep,
/// not on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// A task with a timeout above this is treated as long-running and
    /// decomposed into checkpointed subtasks.
    pub long_running_threshold_ms: u64,
    /// Maximum duration of a generated subtask; also its timeout.
    pub max_subtask_duration_ms: u64,
    /// Upper bound on any parallel group's timeout.
    pub group_timeout_ms: u64,
    /// TTL for intermediate results (default 24h).
    pub intermediate_ttl_ms: i64,
    /// TTL for context snapshots.
    pub snapshot_ttl_ms: i64,
    /// TTL for mailbox messages.
    pub message_ttl_ms: i64,
    /// Age after which the registry drops cached results for finished tasks.
    pub result_cache_max_age_ms: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            long_running_threshold_ms: 300_000,
            max_subtask_duration_ms: 120_000,
            group_timeout_ms: 600_000,
            intermediate_ttl_ms: 24 * 60 * 60 * 1000,
            snapshot_ttl_ms: 24 * 60 * 60 * 1000,
            message_ttl_ms: 24 * 60 * 60 * 1000,
            result_cache_max_age_ms: 60 * 60 * 1000,
        }
    }
}

impl CoreConfig {
    /// Load config from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
