use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Mailbox entry for status/result/error notifications.
///
/// The mailbox is append/scan only: an observability log, not a
/// delivery-guaranteed queue. A message without `to` is a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub data: Value,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Status,
    Result,
    Error,
}

impl Message {
    pub fn new(kind: MessageKind, from: impl Into<String>, data: Value) -> Self {
        Self {
            id: format!(
                "msg-{}",
                Uuid::new_v4().to_string().split('-').next().unwrap()
            ),
            kind,
            from: from.into(),
            to: None,
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }
}

/// Scan filter. `to` matches addressed messages plus broadcasts.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub to: Option<String>,
    pub kind: Option<MessageKind>,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(kind) = self.kind {
            if message.kind != kind {
                return false;
            }
        }
        if let Some(to) = &self.to {
            return match &message.to {
                None => true,
                Some(addr) => addr == to,
            };
        }
        true
    }
}
