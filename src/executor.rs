//! The seam to external collaborators.
//!
//! Content generation, scraping, posting and analytics live behind
//! [`TaskExecutor`] implementations registered by task type. The core calls
//! them once per attempt, passes a real cancellation token, and performs no
//! retries of its own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::task::{Task, TaskType};

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task's work and return a JSON-serializable payload.
    ///
    /// Implementations should watch `cancel` and bail out early when it
    /// fires; the core cancels it on timeout and on cooperative cancellation.
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value>;
}

/// Type-keyed executor dispatch.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type, executor);
    }

    pub fn with(mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(task_type, executor);
        self
    }

    pub async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value> {
        let executor = self.executors.get(&task.task_type).ok_or_else(|| {
            CoreError::Executor {
                task_id: task.id.clone(),
                message: format!("no executor registered for {:?}", task.task_type),
            }
        })?;
        executor.execute(task, cancel).await
    }
}

/// Closure adapter, mostly for tests.
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, task: &Task, _cancel: CancellationToken) -> Result<Value> {
        (self.0)(task.clone()).await
    }
}

/// Demo executor used by the CLI: sleeps for `config.simulate_duration_ms`
/// (if set), honors cancellation, then echoes the task config back.
pub struct SimulatedExecutor;

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value> {
        if let Some(ms) = task.config.get("simulate_duration_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled(task.id.clone()));
                }
            }
        }
        if let Some(message) = task.config.get("simulate_error").and_then(Value::as_str) {
            return Err(CoreError::Executor {
                task_id: task.id.clone(),
                message: message.to_string(),
            });
        }
        Ok(json!({
            "task": task.name,
            "type": task.task_type,
            "config": task.config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let registry = ExecutorRegistry::new().with(
            TaskType::Collect,
            Arc::new(FnExecutor(|task: Task| async move {
                Ok(json!({"collected_for": task.name}))
            })),
        );

        let task = Task::new("mentions", TaskType::Collect);
        let payload = registry
            .execute(&task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload["collected_for"], "mentions");
    }

    #[tokio::test]
    async fn test_unregistered_type_is_executor_error() {
        let registry = ExecutorRegistry::new();
        let task = Task::new("orphan", TaskType::Post);
        let err = registry
            .execute(&task, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Executor { .. }));
    }

    #[tokio::test]
    async fn test_simulated_executor_honors_cancel() {
        let task = Task::new("slow", TaskType::Custom)
            .with_config(json!({"simulate_duration_ms": 60_000}));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = SimulatedExecutor
            .execute(&task, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled(_)));
    }
}
