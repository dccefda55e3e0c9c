use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use super::{sort_records, Record, RecordKind, Store};
use crate::error::Result;
use crate::message::{Message, MessageFilter};

/// In-memory store for tests and embedding. Same contract as [`FileStore`],
/// nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(RecordKind, String), Record>>,
    messages: RwLock<Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record with a caller-controlled timestamp. Test hook for
    /// exercising "latest" selection deterministically.
    pub fn put_record(&self, kind: RecordKind, record: Record) -> Result<()> {
        self.records
            .write()
            .expect("record map poisoned")
            .insert((kind, record.key.clone()), record);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn put(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        self.put_record(kind, Record::new(key, value.clone()))
    }

    fn get(&self, kind: RecordKind, key: &str) -> Option<Value> {
        self.records
            .read()
            .expect("record map poisoned")
            .get(&(kind, key.to_string()))
            .map(|record| record.value.clone())
    }

    fn list(&self, kind: RecordKind, key_prefix: &str) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .read()
            .expect("record map poisoned")
            .iter()
            .filter(|((k, key), _)| *k == kind && key.starts_with(key_prefix))
            .map(|(_, record)| record.clone())
            .collect();
        sort_records(&mut records);
        records
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.records
            .write()
            .expect("record map poisoned")
            .remove(&(kind, key.to_string()));
        Ok(())
    }

    fn append(&self, message: &Message) -> Result<()> {
        self.messages
            .write()
            .expect("mailbox poisoned")
            .push(message.clone());
        Ok(())
    }

    fn scan(&self, filter: &MessageFilter) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .read()
            .expect("mailbox poisoned")
            .iter()
            .filter(|message| filter.matches(message))
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        messages
    }

    fn sweep_expired(&self, kind: RecordKind, predicate: &dyn Fn(&Record) -> bool) -> usize {
        let mut records = self.records.write().expect("record map poisoned");
        let before = records.len();
        records.retain(|(k, _), record| *k != kind || !predicate(record));
        before - records.len()
    }

    fn sweep_messages(&self, predicate: &dyn Fn(&Message) -> bool) -> usize {
        let mut messages = self.messages.write().expect("mailbox poisoned");
        let before = messages.len();
        messages.retain(|message| !predicate(message));
        before - messages.len()
    }
}
