use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use super::{sort_records, Record, RecordKind, Store};
use crate::error::Result;
use crate::message::{Message, MessageFilter};

/// File-backed store: one pretty-printed JSON document per record, grouped
/// in a directory per [`RecordKind`], mailbox under `messages/`.
///
/// Replacement is atomic (write to a sibling tmp file, then rename), so
/// readers never observe a partially written record. Concurrent writes to
/// the same key are serialized through a per-key lock.
pub struct FileStore {
    base_dir: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.base_dir.join(kind.dir()).join(format!("{key}.json"))
    }

    fn messages_dir(&self) -> PathBuf {
        self.base_dir.join("messages")
    }

    fn key_lock(&self, kind: RecordKind, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("key lock map poisoned");
        locks
            .entry(format!("{}/{}", kind.dir(), key))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_record(path: &Path) -> Option<Record> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(?path, %err, "unreadable record treated as absent");
                }
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(?path, %err, "corrupt record treated as absent");
                None
            }
        }
    }

    /// All `.json` files under `dir`, one level of session subdirectories
    /// included.
    fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(&path, out);
            } else if path.extension().is_some_and(|e| e == "json") {
                out.push(path);
            }
        }
    }

    fn all_records(&self, kind: RecordKind) -> Vec<(PathBuf, Record)> {
        let mut files = vec![];
        Self::collect_files(&self.base_dir.join(kind.dir()), &mut files);
        files
            .into_iter()
            .filter_map(|path| Self::read_record(&path).map(|record| (path, record)))
            .collect()
    }
}

impl Store for FileStore {
    fn put(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        let lock = self.key_lock(kind, key);
        let _guard = lock.lock().expect("key lock poisoned");

        let record = Record::new(key, value.clone());
        let content = serde_json::to_string_pretty(&record)?;
        Self::write_atomic(&self.record_path(kind, key), &content)
    }

    fn get(&self, kind: RecordKind, key: &str) -> Option<Value> {
        Self::read_record(&self.record_path(kind, key)).map(|record| record.value)
    }

    fn list(&self, kind: RecordKind, key_prefix: &str) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .all_records(kind)
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| record.key.starts_with(key_prefix))
            .collect();
        sort_records(&mut records);
        records
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let lock = self.key_lock(kind, key);
        let _guard = lock.lock().expect("key lock poisoned");

        match fs::remove_file(self.record_path(kind, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn append(&self, message: &Message) -> Result<()> {
        let path = self.messages_dir().join(format!("message-{}.json", message.id));
        let content = serde_json::to_string_pretty(message)?;
        Self::write_atomic(&path, &content)
    }

    fn scan(&self, filter: &MessageFilter) -> Vec<Message> {
        let mut files = vec![];
        Self::collect_files(&self.messages_dir(), &mut files);

        let mut messages: Vec<Message> = files
            .into_iter()
            .filter_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                match serde_json::from_str::<Message>(&content) {
                    Ok(message) => Some(message),
                    Err(err) => {
                        warn!(?path, %err, "corrupt message skipped");
                        None
                    }
                }
            })
            .filter(|message| filter.matches(message))
            .collect();
        messages.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        messages
    }

    fn sweep_expired(&self, kind: RecordKind, predicate: &dyn Fn(&Record) -> bool) -> usize {
        let mut removed = 0;
        for (path, record) in self.all_records(kind) {
            if predicate(&record) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn sweep_messages(&self, predicate: &dyn Fn(&Message) -> bool) -> usize {
        let mut files = vec![];
        Self::collect_files(&self.messages_dir(), &mut files);

        let mut removed = 0;
        for path in files {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(message) = serde_json::from_str::<Message>(&content) else {
                continue;
            };
            if predicate(&message) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store
            .put(RecordKind::Status, "status-t1", &json!({"state": "running"}))
            .unwrap();

        let value = store.get(RecordKind::Status, "status-t1").unwrap();
        assert_eq!(value["state"], "running");
        assert!(tmp.path().join("status/status-t1.json").exists());
    }

    #[test]
    fn test_missing_and_corrupt_read_as_absent() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        assert!(store.get(RecordKind::Status, "status-none").is_none());

        fs::create_dir_all(tmp.path().join("status")).unwrap();
        fs::write(tmp.path().join("status/status-bad.json"), "{not json").unwrap();
        assert!(store.get(RecordKind::Status, "status-bad").is_none());

        // Corrupt records do not break listing either
        store
            .put(RecordKind::Status, "status-good", &json!({"ok": true}))
            .unwrap();
        let listed = store.list(RecordKind::Status, "status-");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "status-good");
    }

    #[test]
    fn test_session_results_nest_under_session_dir() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store
            .put(RecordKind::SessionResult, "sess1/result-t1", &json!({"ok": 1}))
            .unwrap();
        store
            .put(RecordKind::SessionResult, "sess1/result-t2", &json!({"ok": 2}))
            .unwrap();
        store
            .put(RecordKind::SessionResult, "sess2/result-t9", &json!({"ok": 9}))
            .unwrap();

        assert!(tmp
            .path()
            .join("parallel_sessions/sess1/result-t1.json")
            .exists());
        let session = store.list(RecordKind::SessionResult, "sess1/");
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store
            .put(RecordKind::Intermediate, "intermediate-t1-a", &json!({}))
            .unwrap();
        store.delete(RecordKind::Intermediate, "intermediate-t1-a").unwrap();
        store.delete(RecordKind::Intermediate, "intermediate-t1-a").unwrap();
        assert!(store.get(RecordKind::Intermediate, "intermediate-t1-a").is_none());
    }

    #[test]
    fn test_mailbox_append_scan_order() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        let mut first = Message::new(MessageKind::Status, "orchestrator", json!({"n": 1}));
        first.timestamp_ms = 100;
        let mut second = Message::new(MessageKind::Error, "scheduler", json!({"n": 2}));
        second.timestamp_ms = 200;

        // Append out of order; scan must come back timestamp-ascending
        store.append(&second).unwrap();
        store.append(&first).unwrap();

        let all = store.scan(&MessageFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].data["n"], 1);
        assert_eq!(all[1].data["n"], 2);

        let errors = store.scan(&MessageFilter {
            to: None,
            kind: Some(MessageKind::Error),
        });
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_sweep_expired_removes_only_matching() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store
            .put(RecordKind::Intermediate, "intermediate-t1-a", &json!({"expires_at_ms": 10}))
            .unwrap();
        store
            .put(
                RecordKind::Intermediate,
                "intermediate-t1-b",
                &json!({"expires_at_ms": i64::MAX}),
            )
            .unwrap();

        let removed = store.sweep_expired(RecordKind::Intermediate, &|record| {
            record.value["expires_at_ms"].as_i64().unwrap_or(0) < 1_000
        });
        assert_eq!(removed, 1);

        let remaining = store.list(RecordKind::Intermediate, "intermediate-t1-");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "intermediate-t1-b");
    }
}
