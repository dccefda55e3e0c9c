use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::store::{RecordKind, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// The current status record for one task id. At most one record per task id
/// is current; terminal states are final for that record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub task_id: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// 0–100, monotonically non-decreasing while running.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial update applied as a structural merge: fields left `None` keep
/// their existing values.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub state: Option<TaskState>,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            state: Some(TaskState::Running),
            ..Default::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            state: Some(TaskState::Completed),
            progress: Some(100),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: Some(TaskState::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }
}

/// CRUD over status records. The only writer of `status/` records.
#[derive(Clone)]
pub struct TaskStatusTracker {
    store: Arc<dyn Store>,
}

impl TaskStatusTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(task_id: &str) -> String {
        format!("status-{task_id}")
    }

    /// Create a fresh pending record for the task, replacing any previous one.
    pub fn create(&self, task_id: &str) -> Result<TaskStatus> {
        let status = TaskStatus {
            id: format!(
                "st-{}",
                Uuid::new_v4().to_string().split('-').next().unwrap()
            ),
            task_id: task_id.to_string(),
            state: TaskState::Pending,
            started_at: Utc::now(),
            ended_at: None,
            progress: 0,
            error: None,
        };
        self.store.put(
            RecordKind::Status,
            &Self::key(task_id),
            &serde_json::to_value(&status)?,
        )?;
        Ok(status)
    }

    /// Merge `update` into the existing record. A status must be created
    /// before it can be updated. Progress never regresses, and terminal
    /// records are frozen: updates against them return the record unchanged.
    pub fn update(&self, task_id: &str, update: StatusUpdate) -> Result<TaskStatus> {
        let mut status = self
            .get(task_id)
            .ok_or_else(|| CoreError::NotFound(format!("status for task {task_id}")))?;

        if status.state.is_terminal() {
            debug!(task_id, state = ?status.state, "ignoring update to terminal status");
            return Ok(status);
        }

        if let Some(state) = update.state {
            status.state = state;
            if state.is_terminal() && status.ended_at.is_none() {
                status.ended_at = Some(Utc::now());
            }
        }
        if let Some(progress) = update.progress {
            if progress < status.progress {
                debug!(
                    task_id,
                    current = status.progress,
                    requested = progress,
                    "ignoring progress regression"
                );
            } else {
                status.progress = progress.min(100);
            }
        }
        if let Some(error) = update.error {
            status.error = Some(error);
        }

        self.store.put(
            RecordKind::Status,
            &Self::key(task_id),
            &serde_json::to_value(&status)?,
        )?;
        Ok(status)
    }

    pub fn get(&self, task_id: &str) -> Option<TaskStatus> {
        let value = self.store.get(RecordKind::Status, &Self::key(task_id))?;
        serde_json::from_value(value).ok()
    }

    /// All records still pending or running.
    pub fn list_active(&self) -> Vec<TaskStatus> {
        self.store
            .list(RecordKind::Status, "status-")
            .into_iter()
            .filter_map(|record| serde_json::from_value::<TaskStatus>(record.value).ok())
            .filter(|status| status.state.is_active())
            .collect()
    }

    /// Progress for the task, 0 if no record exists.
    pub fn progress(&self, task_id: &str) -> u8 {
        self.get(task_id).map(|status| status.progress).unwrap_or(0)
    }
}
