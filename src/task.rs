use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What kind of work a task represents. Executors are dispatched by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Data collection (scraping, feed ingestion)
    Collect,
    /// Analysis over collected data
    Analyze,
    /// Content posting
    Post,
    /// Strategy revision
    Strategy,
    #[default]
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Scheduling order: high groups resolve before medium before low.
    pub const ORDERED: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

/// A unit of work. Immutable once submitted.
///
/// Tasks with non-empty `dependencies` are scheduled sequentially and never
/// join a parallel group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "generate_task_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Opaque executor configuration.
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    /// Caller-supplied decomposition, used verbatim when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined_subtasks: Option<Vec<Task>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn generate_task_id() -> String {
    format!(
        "task-{}",
        Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: generate_task_id(),
            name: name.into(),
            task_type,
            priority: Priority::Medium,
            timeout_ms: default_timeout_ms(),
            dependencies: vec![],
            config: Value::Null,
            estimated_duration_ms: None,
            predefined_subtasks: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = Some(ms);
        self
    }

    pub fn with_subtasks(mut self, subtasks: Vec<Task>) -> Self {
        self.predefined_subtasks = Some(subtasks);
        self
    }

    /// Parallel-eligible tasks carry no dependencies.
    pub fn is_parallel_eligible(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Outcome of one execution attempt. Produced exactly once per attempt and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn ok(task_id: impl Into<String>, data: Value, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_builder() {
        let task = Task::new("fetch mentions", TaskType::Collect)
            .with_priority(Priority::High)
            .with_timeout_ms(5_000)
            .with_config(json!({"source": "mentions"}));

        assert!(task.id.starts_with("task-"));
        assert_eq!(task.task_type, TaskType::Collect);
        assert_eq!(task.priority, Priority::High);
        assert!(task.is_parallel_eligible());
    }

    #[test]
    fn test_dependencies_disable_parallel() {
        let task = Task::new("post digest", TaskType::Post)
            .with_dependencies(vec!["task-a".to_string()]);
        assert!(!task.is_parallel_eligible());
    }

    #[test]
    fn test_deserialize_minimal_task_json() {
        let task: Task =
            serde_json::from_str(r#"{"name": "collect feeds", "type": "collect"}"#).unwrap();
        assert_eq!(task.task_type, TaskType::Collect);
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.timeout_ms, 30_000);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_result_shapes() {
        let ok = TaskResult::ok("t1", json!({"posts": 3}), 120);
        assert!(ok.success && ok.error.is_none());

        let failed = TaskResult::failed("t1", "rate limited", 50);
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("rate limited"));
    }
}
