//! Durable persistence for the execution core.
//!
//! Everything the core remembers across restarts goes through the [`Store`]
//! trait: status records, intermediate results, context snapshots, per-session
//! task results, merged workflow results, and the notification mailbox.
//! Components never touch paths directly; backends are injected
//! ([`FileStore`] in production, [`MemoryStore`] in tests).

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::{Message, MessageFilter};

/// Namespaces for durable records. Each maps to a directory in the file
/// backend so records stay human-inspectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// `status/status-<taskId>`
    Status,
    /// `intermediate/intermediate-<taskId>-<resultId>`
    Intermediate,
    /// `contexts/context-<taskId>-<snapshotId>`
    Context,
    /// `parallel_sessions/<sessionId>/result-<taskId>`
    SessionResult,
    /// `merged_results/<sessionId>`
    Merged,
}

impl RecordKind {
    pub fn dir(&self) -> &'static str {
        match self {
            RecordKind::Status => "status",
            RecordKind::Intermediate => "intermediate",
            RecordKind::Context => "contexts",
            RecordKind::SessionResult => "parallel_sessions",
            RecordKind::Merged => "merged_results",
        }
    }
}

/// Stored envelope. The explicit `timestamp_ms` is the version index:
/// "latest" selection compares timestamps and tie-breaks on key order,
/// never on filename heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub timestamp_ms: i64,
    pub value: Value,
}

impl Record {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            value,
        }
    }
}

/// Persistence contract.
///
/// Writes are whole-record replace and their failures propagate to the
/// caller. Reads are lenient: missing or corrupt records come back as absent
/// (logged), never as errors, so task execution survives partial storage
/// corruption.
pub trait Store: Send + Sync {
    /// Whole-record replace under `kind`/`key`.
    fn put(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()>;

    /// `None` when missing or unreadable.
    fn get(&self, kind: RecordKind, key: &str) -> Option<Value>;

    /// All records whose key starts with `key_prefix`, sorted by
    /// `(timestamp_ms, key)` ascending.
    fn list(&self, kind: RecordKind, key_prefix: &str) -> Vec<Record>;

    /// Deleting a missing key is not an error.
    fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;

    /// Append a mailbox message.
    fn append(&self, message: &Message) -> Result<()>;

    /// Matching messages, sorted by timestamp ascending.
    fn scan(&self, filter: &MessageFilter) -> Vec<Message>;

    /// Delete records the predicate marks expired; returns how many went.
    fn sweep_expired(&self, kind: RecordKind, predicate: &dyn Fn(&Record) -> bool) -> usize;

    /// Same sweep for the mailbox.
    fn sweep_messages(&self, predicate: &dyn Fn(&Message) -> bool) -> usize;

    /// Latest record under the prefix: max timestamp, key order breaking ties.
    fn latest(&self, kind: RecordKind, key_prefix: &str) -> Option<Record> {
        self.list(kind, key_prefix).into_iter().last()
    }
}

/// Shared ordering for list results so every backend agrees on "latest".
pub(crate) fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.key.cmp(&b.key))
    });
}
