//! Fire-and-forget execution with later join.
//!
//! `start` returns immediately; a monitor task drives the execution, posts a
//! mailbox notification when it settles, and parks the result in a bounded
//! cache so late `wait` calls still resolve.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::decompose::LongRunningDecomposer;
use crate::error::{CoreError, Result};
use crate::executor::ExecutorRegistry;
use crate::message::{Message, MessageKind};
use crate::scheduler::ParallelScheduler;
use crate::status::{StatusUpdate, TaskState, TaskStatusTracker};
use crate::store::Store;
use crate::task::{Task, TaskResult};

/// Join policy for [`AsyncTaskRegistry::wait_many`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait for every known task; unknown ids are skipped.
    All,
    /// Resolve with the first task that settles.
    Any,
}

struct TaskHandle {
    cancel: CancellationToken,
    rx: watch::Receiver<Option<TaskResult>>,
}

/// Tracks in-flight background tasks by id.
///
/// A task id is present in the handle map only while its monitor is alive;
/// settled results move to the cache until [`cleanup_completed`] drops them.
///
/// [`cleanup_completed`]: AsyncTaskRegistry::cleanup_completed
#[derive(Clone)]
pub struct AsyncTaskRegistry {
    store: Arc<dyn Store>,
    tracker: TaskStatusTracker,
    scheduler: ParallelScheduler,
    decomposer: LongRunningDecomposer,
    config: CoreConfig,
    handles: Arc<Mutex<HashMap<String, TaskHandle>>>,
    results: Arc<Mutex<HashMap<String, TaskResult>>>,
}

impl AsyncTaskRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        executors: Arc<ExecutorRegistry>,
        config: CoreConfig,
    ) -> Self {
        let scheduler = ParallelScheduler::new(store.clone(), executors, config.clone());
        let decomposer =
            LongRunningDecomposer::new(store.clone(), scheduler.clone(), config.clone());
        Self {
            tracker: TaskStatusTracker::new(store.clone()),
            store,
            scheduler,
            decomposer,
            config,
            handles: Arc::new(Mutex::new(HashMap::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launch the task in the background and return its id.
    ///
    /// Rejects an id that is already in flight. Long-running tasks go through
    /// the decomposer; everything else runs as a single timed attempt under
    /// an `async-<taskId>` session.
    pub fn start(&self, task: Task) -> Result<String> {
        let task_id = task.id.clone();
        {
            let mut handles = self.handles.lock().expect("handle map poisoned");
            if handles.contains_key(&task_id) {
                return Err(CoreError::InvalidWorkflow(format!(
                    "task {task_id} is already running"
                )));
            }

            self.tracker.create(&task_id)?;
            let cancel = CancellationToken::new();
            let (tx, rx) = watch::channel(None);
            handles.insert(
                task_id.clone(),
                TaskHandle {
                    cancel: cancel.clone(),
                    rx,
                },
            );

            let registry = self.clone();
            tokio::spawn(async move {
                registry.monitor(task, cancel, tx).await;
            });
        }
        info!(task_id = %task_id, "started background task");
        Ok(task_id)
    }

    /// Drives one background execution to a settled result. Storage errors
    /// in here are logged and folded into a failed result; nothing to
    /// propagate them to.
    async fn monitor(
        &self,
        task: Task,
        cancel: CancellationToken,
        tx: watch::Sender<Option<TaskResult>>,
    ) {
        let outcome = if self.decomposer.qualifies(&task) {
            self.decomposer.run(&task, cancel).await
        } else {
            self.scheduler
                .execute_with_timeout(
                    &task,
                    self.config.group_timeout_ms,
                    &format!("async-{}", task.id),
                    cancel,
                )
                .await
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(task_id = %task.id, %err, "background task infrastructure failure");
                TaskResult::failed(&task.id, err.to_string(), 0)
            }
        };

        let kind = if result.success {
            MessageKind::Result
        } else {
            MessageKind::Error
        };
        let notification = match serde_json::to_value(&result) {
            Ok(data) => Message::new(kind, "registry", data),
            Err(err) => {
                warn!(task_id = %task.id, %err, "result not serializable");
                Message::new(kind, "registry", serde_json::Value::Null)
            }
        };
        if let Err(err) = self.store.append(&notification) {
            warn!(task_id = %task.id, %err, "failed to post completion message");
        }

        self.results
            .lock()
            .expect("result cache poisoned")
            .insert(task.id.clone(), result.clone());
        self.handles
            .lock()
            .expect("handle map poisoned")
            .remove(&task.id);
        // Waiters already holding a receiver still resolve after eviction.
        let _ = tx.send(Some(result));
    }

    /// Request cooperative cancellation. Returns `false` without touching
    /// any state when the task is not in flight.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let handle = self
            .handles
            .lock()
            .expect("handle map poisoned")
            .remove(task_id);
        let Some(handle) = handle else {
            return Ok(false);
        };

        handle.cancel.cancel();
        self.tracker
            .update(task_id, StatusUpdate::failed("cancelled"))?;
        info!(task_id, "cancelled background task");
        Ok(true)
    }

    /// Wait for the task to settle, up to `timeout_ms`.
    pub async fn wait(&self, task_id: &str, timeout_ms: u64) -> Result<TaskResult> {
        let waiter = self
            .result_future(task_id)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), waiter).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout { ms: timeout_ms }),
        }
    }

    /// Wait on several tasks at once.
    ///
    /// `All` skips unknown ids and returns the known results in input order;
    /// a batch with no known ids is an error. `Any` resolves with the first
    /// settled result.
    pub async fn wait_many(
        &self,
        task_ids: &[String],
        mode: WaitMode,
        timeout_ms: u64,
    ) -> Result<Vec<TaskResult>> {
        let waiters: Vec<_> = task_ids
            .iter()
            .filter_map(|task_id| self.result_future(task_id))
            .collect();
        if waiters.is_empty() {
            return Err(CoreError::NoValidTasks);
        }

        let joined = async move {
            match mode {
                WaitMode::All => futures::future::join_all(waiters)
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>>>(),
                WaitMode::Any => {
                    let (first, _index, _rest) = futures::future::select_all(waiters).await;
                    first.map(|result| vec![result])
                }
            }
        };
        match tokio::time::timeout(Duration::from_millis(timeout_ms), joined).await {
            Ok(results) => results,
            Err(_) => Err(CoreError::Timeout { ms: timeout_ms }),
        }
    }

    /// A future resolving with the task's result, or `None` when the id is
    /// neither in flight nor cached.
    fn result_future(&self, task_id: &str) -> Option<BoxFuture<'static, Result<TaskResult>>> {
        let rx = self
            .handles
            .lock()
            .expect("handle map poisoned")
            .get(task_id)
            .map(|handle| handle.rx.clone());
        if let Some(mut rx) = rx {
            let task_id = task_id.to_string();
            return Some(Box::pin(async move {
                loop {
                    let settled = rx.borrow().clone();
                    if let Some(result) = settled {
                        return Ok(result);
                    }
                    rx.changed()
                        .await
                        .map_err(|_| CoreError::Cancelled(task_id.clone()))?;
                }
            }));
        }
        let cached = self
            .results
            .lock()
            .expect("result cache poisoned")
            .get(task_id)
            .cloned();
        cached.map(|result| Box::pin(async move { Ok(result) }) as BoxFuture<'static, _>)
    }

    /// Drop cached results older than `max_age_ms`; returns how many were
    /// evicted. Durable records are pruned by the store's own TTL sweep,
    /// not here.
    pub fn cleanup_completed(&self, max_age_ms: i64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age_ms;
        let mut results = self.results.lock().expect("result cache poisoned");
        let before = results.len();
        results.retain(|_, result| result.timestamp.timestamp_millis() >= cutoff);
        before - results.len()
    }

    /// Startup recovery: any status still `running` belongs to a previous
    /// process and can never settle, so fail it closed.
    pub fn recover_running(&self, reason: &str) -> Result<usize> {
        let stale: Vec<String> = self
            .tracker
            .list_active()
            .into_iter()
            .filter(|status| status.state == TaskState::Running)
            .map(|status| status.task_id)
            .collect();
        for task_id in &stale {
            warn!(task_id = %task_id, "failing stale running task from previous run");
            self.tracker.update(task_id, StatusUpdate::failed(reason))?;
        }
        Ok(stale.len())
    }
}
