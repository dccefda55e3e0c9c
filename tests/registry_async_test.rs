//! Async task registry integration tests:
//! - fire-and-forget start with later wait
//! - cooperative cancellation
//! - multi-task waits (all / any)
//! - mailbox notification on completion
//! - stale-status recovery after a simulated restart

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tempfile::TempDir;

use cadence::{
    AsyncTaskRegistry, CoreConfig, CoreError, ExecutorRegistry, FileStore, FnExecutor,
    MessageFilter, MessageKind, StatusUpdate, Store, Task, TaskState, TaskStatusTracker,
    TaskType, WaitMode,
};

fn test_executors() -> Arc<ExecutorRegistry> {
    let executor = Arc::new(FnExecutor(|task: Task| async move {
        if let Some(ms) = task.config.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if task.config.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(CoreError::Executor {
                task_id: task.id.clone(),
                message: "simulated failure".to_string(),
            });
        }
        Ok(json!({"done": task.name}))
    }));
    let mut registry = ExecutorRegistry::new();
    registry.register(TaskType::Custom, executor);
    Arc::new(registry)
}

fn registry(store: Arc<FileStore>) -> AsyncTaskRegistry {
    AsyncTaskRegistry::new(store, test_executors(), CoreConfig::default())
}

// ============================================================================
// Start / wait
// ============================================================================

#[tokio::test]
async fn test_start_wait_roundtrip_with_durable_status() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(FileStore::new(tmp.path())?);
    let registry = registry(store.clone());

    let task_id = registry.start(Task::new("quick", TaskType::Custom).with_id("quick"))?;
    let result = registry.wait(&task_id, 5_000).await?;
    assert!(result.success);

    let tracker = TaskStatusTracker::new(store);
    let status = tracker.get("quick").unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert!(tmp.path().join("status/status-quick.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_wait_timeout_and_not_found() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(FileStore::new(tmp.path())?);
    let registry = registry(store);

    registry.start(
        Task::new("slow", TaskType::Custom)
            .with_id("slow")
            .with_config(json!({"sleep_ms": 5_000})),
    )?;
    assert!(matches!(
        registry.wait("slow", 20).await.unwrap_err(),
        CoreError::Timeout { ms: 20 }
    ));
    assert!(matches!(
        registry.wait("ghost", 20).await.unwrap_err(),
        CoreError::NotFound(_)
    ));
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_running_task() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(FileStore::new(tmp.path())?);
    let registry = registry(store.clone());

    registry.start(
        Task::new("slow", TaskType::Custom)
            .with_id("slow")
            .with_config(json!({"sleep_ms": 10_000})),
    )?;
    assert!(registry.cancel("slow")?);

    let tracker = TaskStatusTracker::new(store);
    let status = tracker.get("slow").unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.error.as_deref(), Some("cancelled"));

    // Cancelling again is a clean no-op
    assert!(!registry.cancel("slow")?);
    Ok(())
}

// ============================================================================
// Multi-task waits
// ============================================================================

#[tokio::test]
async fn test_wait_many_all_and_any() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(FileStore::new(tmp.path())?);
    let registry = registry(store);

    registry.start(Task::new("a", TaskType::Custom).with_id("a"))?;
    registry.start(
        Task::new("b", TaskType::Custom)
            .with_id("b")
            .with_config(json!({"sleep_ms": 200})),
    )?;

    let first = registry
        .wait_many(&["a".to_string(), "b".to_string()], WaitMode::Any, 5_000)
        .await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].task_id, "a");

    let all = registry
        .wait_many(
            &["a".to_string(), "ghost".to_string(), "b".to_string()],
            WaitMode::All,
            5_000,
        )
        .await?;
    assert_eq!(all.len(), 2);

    let err = registry
        .wait_many(&["ghost".to_string()], WaitMode::All, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoValidTasks));
    Ok(())
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_completion_and_failure_messages() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(FileStore::new(tmp.path())?);
    let registry = registry(store.clone());

    registry.start(Task::new("good", TaskType::Custom).with_id("good"))?;
    registry.start(
        Task::new("bad", TaskType::Custom)
            .with_id("bad")
            .with_config(json!({"fail": true})),
    )?;
    registry
        .wait_many(&["good".to_string(), "bad".to_string()], WaitMode::All, 5_000)
        .await?;

    let results = store.scan(&MessageFilter {
        to: None,
        kind: Some(MessageKind::Result),
    });
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data["task_id"], "good");

    let errors = store.scan(&MessageFilter {
        to: None,
        kind: Some(MessageKind::Error),
    });
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["task_id"], "bad");
    Ok(())
}

// ============================================================================
// Restart recovery
// ============================================================================

#[tokio::test]
async fn test_recover_running_after_restart() -> Result<()> {
    let tmp = TempDir::new()?;

    // First process dies while a task is marked running
    {
        let store = Arc::new(FileStore::new(tmp.path())?);
        let tracker = TaskStatusTracker::new(store);
        tracker.create("orphan")?;
        tracker.update("orphan", StatusUpdate::running())?;
        tracker.create("queued")?;
    }

    // Second process recovers at startup
    let store = Arc::new(FileStore::new(tmp.path())?);
    let registry = registry(store.clone());
    let recovered = registry.recover_running("process restarted")?;
    assert_eq!(recovered, 1);

    let tracker = TaskStatusTracker::new(store);
    let orphan = tracker.get("orphan").unwrap();
    assert_eq!(orphan.state, TaskState::Failed);
    assert_eq!(orphan.error.as_deref(), Some("process restarted"));
    assert_eq!(tracker.get("queued").unwrap().state, TaskState::Pending);
    Ok(())
}
