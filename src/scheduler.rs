use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::executor::ExecutorRegistry;
use crate::status::{StatusUpdate, TaskStatusTracker};
use crate::store::{RecordKind, Store};
use crate::task::{Priority, Task, TaskResult};

/// Policy for combining the outcomes of a concurrently executed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    /// First failure aborts the group and propagates; every task's
    /// individual TaskResult is still recorded durably first.
    All,
    /// First settled result wins; the rest keep running detached.
    Race,
    /// Wait for everything, synthesize failed results, never throw.
    Settled,
}

impl JoinStrategy {
    /// High-priority work fails the whole group fast; background work is
    /// not starved by one failure.
    pub fn default_for(priority: Priority) -> Self {
        match priority {
            Priority::High => JoinStrategy::All,
            Priority::Medium | Priority::Low => JoinStrategy::Settled,
        }
    }
}

/// One priority band of parallel-eligible tasks.
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub priority: Priority,
    pub strategy: JoinStrategy,
    pub timeout_ms: u64,
    pub tasks: Vec<Task>,
}

/// Classifies tasks into parallel/sequential, runs priority groups under
/// their join strategies, and wraps every execution in a per-task timeout
/// race that always converges to a recorded TaskResult.
#[derive(Clone)]
pub struct ParallelScheduler {
    store: Arc<dyn Store>,
    tracker: TaskStatusTracker,
    executors: Arc<ExecutorRegistry>,
    config: CoreConfig,
}

impl ParallelScheduler {
    pub fn new(store: Arc<dyn Store>, executors: Arc<ExecutorRegistry>, config: CoreConfig) -> Self {
        Self {
            tracker: TaskStatusTracker::new(store.clone()),
            store,
            executors,
            config,
        }
    }

    pub fn tracker(&self) -> &TaskStatusTracker {
        &self.tracker
    }

    /// Tasks without dependencies run in parallel groups; tasks with
    /// dependencies run sequentially, in input order.
    pub fn partition(tasks: &[Task]) -> (Vec<Task>, Vec<Task>) {
        tasks
            .iter()
            .cloned()
            .partition(|task| task.is_parallel_eligible())
    }

    /// Group parallel-eligible tasks by priority, preserving input order
    /// within each group. Group timeout is the max member timeout, capped
    /// by the configured bound.
    pub fn group_parallel(&self, parallel: Vec<Task>) -> Vec<ParallelGroup> {
        Priority::ORDERED
            .iter()
            .filter_map(|&priority| {
                let tasks: Vec<Task> = parallel
                    .iter()
                    .filter(|task| task.priority == priority)
                    .cloned()
                    .collect();
                if tasks.is_empty() {
                    return None;
                }
                let timeout_ms = tasks
                    .iter()
                    .map(|task| task.timeout_ms)
                    .max()
                    .unwrap_or(self.config.group_timeout_ms)
                    .min(self.config.group_timeout_ms);
                Some(ParallelGroup {
                    priority,
                    strategy: JoinStrategy::default_for(priority),
                    timeout_ms,
                    tasks,
                })
            })
            .collect()
    }

    /// Run a whole batch under a fresh session namespace.
    pub async fn run(&self, tasks: &[Task]) -> Result<Vec<TaskResult>> {
        self.run_session(tasks, &generate_session_id()).await
    }

    /// Run a batch: parallel groups strictly in priority order, then
    /// dependent tasks strictly one at a time. Returns one TaskResult per
    /// input task, in execution order.
    pub async fn run_session(&self, tasks: &[Task], session_id: &str) -> Result<Vec<TaskResult>> {
        let (parallel, sequential) = Self::partition(tasks);
        let mut results = Vec::with_capacity(tasks.len());

        for group in self.group_parallel(parallel) {
            info!(
                session = session_id,
                priority = ?group.priority,
                strategy = ?group.strategy,
                tasks = group.tasks.len(),
                "running parallel group"
            );
            let group_results = self
                .run_group(&group.tasks, group.strategy, group.timeout_ms, session_id)
                .await?;
            results.extend(group_results);
        }

        for task in &sequential {
            let result = self
                .execute_with_timeout(
                    task,
                    self.config.group_timeout_ms,
                    session_id,
                    CancellationToken::new(),
                )
                .await?;
            results.push(result);
        }

        Ok(results)
    }

    /// Execute one group under a join strategy. Results come back in input
    /// order, not completion order.
    pub async fn run_group(
        &self,
        tasks: &[Task],
        strategy: JoinStrategy,
        group_timeout_ms: u64,
        session_id: &str,
    ) -> Result<Vec<TaskResult>> {
        if tasks.is_empty() {
            return Ok(vec![]);
        }

        let tokens: Vec<CancellationToken> =
            tasks.iter().map(|_| CancellationToken::new()).collect();
        let handles: Vec<_> = tasks
            .iter()
            .zip(&tokens)
            .map(|(task, token)| {
                let scheduler = self.clone();
                let task = task.clone();
                let token = token.clone();
                let session = session_id.to_string();
                tokio::spawn(async move {
                    scheduler
                        .execute_with_timeout(&task, group_timeout_ms, &session, token)
                        .await
                })
            })
            .collect();

        match strategy {
            JoinStrategy::Settled => {
                let mut results = Vec::with_capacity(tasks.len());
                for (task, handle) in tasks.iter().zip(handles) {
                    match handle.await {
                        Ok(result) => results.push(result?),
                        Err(join_err) => {
                            warn!(task_id = %task.id, %join_err, "task execution panicked");
                            results.push(TaskResult::failed(
                                &task.id,
                                format!("execution panicked: {join_err}"),
                                0,
                            ));
                        }
                    }
                }
                Ok(results)
            }
            JoinStrategy::All => {
                // Race the whole group so a failure aborts as soon as it
                // settles, not when input-order collection reaches it.
                let mut remaining: Vec<_> = handles
                    .into_iter()
                    .enumerate()
                    .map(|(index, handle)| async move { (index, handle.await) }.boxed())
                    .collect();
                let mut settled = Vec::with_capacity(tasks.len());
                while !remaining.is_empty() {
                    let ((index, joined), _, rest) =
                        futures::future::select_all(remaining).await;
                    remaining = rest;
                    let result = match joined {
                        Ok(Ok(result)) => result,
                        Ok(Err(err)) => {
                            tokens.iter().for_each(|token| token.cancel());
                            return Err(err);
                        }
                        Err(join_err) => {
                            tokens.iter().for_each(|token| token.cancel());
                            return Err(CoreError::Executor {
                                task_id: tasks[index].id.clone(),
                                message: format!("execution panicked: {join_err}"),
                            });
                        }
                    };
                    if !result.success {
                        // Cancel the rest of the group; the siblings finalize
                        // their own records on the way out.
                        tokens.iter().for_each(|token| token.cancel());
                        return Err(CoreError::Executor {
                            task_id: result.task_id,
                            message: result.error.unwrap_or_else(|| "task failed".to_string()),
                        });
                    }
                    settled.push((index, result));
                }
                settled.sort_by_key(|(index, _)| *index);
                Ok(settled.into_iter().map(|(_, result)| result).collect())
            }
            JoinStrategy::Race => {
                let (first, _index, rest) = futures::future::select_all(handles).await;
                // Losers keep running detached; their results still land in
                // the store when they finish.
                drop(rest);
                match first {
                    Ok(result) => Ok(vec![result?]),
                    Err(join_err) => Err(CoreError::Executor {
                        task_id: "race".to_string(),
                        message: format!("execution panicked: {join_err}"),
                    }),
                }
            }
        }
    }

    /// The single-task wrapper: mark running, race the executor against
    /// `min(task.timeout_ms, group_timeout_ms)`, and converge every outcome
    /// (success, error, timeout, cancellation, panic) into a durably
    /// recorded TaskResult. Only store write failures surface as errors.
    pub async fn execute_with_timeout(
        &self,
        task: &Task,
        group_timeout_ms: u64,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<TaskResult> {
        let effective_ms = task.timeout_ms.min(group_timeout_ms);
        let started = Instant::now();

        match self.tracker.get(&task.id) {
            Some(status) if status.state.is_active() => {}
            // Missing or terminal: this attempt gets a fresh record
            _ => {
                self.tracker.create(&task.id)?;
            }
        }
        self.tracker.update(&task.id, StatusUpdate::running())?;

        let executor_handle = tokio::spawn({
            let executors = self.executors.clone();
            let task = task.clone();
            let token = cancel.clone();
            async move { executors.execute(&task, token).await }
        });

        let outcome: std::result::Result<serde_json::Value, String> = tokio::select! {
            res = tokio::time::timeout(Duration::from_millis(effective_ms), executor_handle) => {
                match res {
                    Ok(Ok(Ok(value))) => Ok(value),
                    Ok(Ok(Err(err))) => Err(err.to_string()),
                    Ok(Err(join_err)) => Err(format!("executor panicked: {join_err}")),
                    Err(_) => {
                        // Timer won the race. Tell the executor to stop; we
                        // do not wait for it to comply.
                        cancel.cancel();
                        Err(format!("timed out after {effective_ms}ms"))
                    }
                }
            }
            _ = cancel.cancelled() => Err("cancelled".to_string()),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(data) => {
                self.tracker.update(&task.id, StatusUpdate::completed())?;
                TaskResult::ok(&task.id, data, duration_ms)
            }
            Err(message) => {
                warn!(task_id = %task.id, %message, "task failed");
                self.tracker.update(&task.id, StatusUpdate::failed(&message))?;
                TaskResult::failed(&task.id, message, duration_ms)
            }
        };

        self.store.put(
            RecordKind::SessionResult,
            &format!("{session_id}/result-{}", task.id),
            &serde_json::to_value(&result)?,
        )?;
        Ok(result)
    }
}

pub(crate) fn generate_session_id() -> String {
    format!(
        "sess-{}",
        Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}
