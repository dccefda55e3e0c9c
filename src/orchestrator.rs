//! Top-level facade: plan, run, observe, maintain.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::executor::ExecutorRegistry;
use crate::message::{Message, MessageFilter, MessageKind};
use crate::registry::AsyncTaskRegistry;
use crate::scheduler::{generate_session_id, JoinStrategy, ParallelScheduler};
use crate::status::TaskStatusTracker;
use crate::store::{RecordKind, Store};
use crate::task::{Priority, Task, TaskResult};

/// Serializable view of one planned parallel group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedGroup {
    pub priority: Priority,
    pub strategy: JoinStrategy,
    pub timeout_ms: u64,
    pub task_ids: Vec<String>,
}

/// What a batch will do before it does it: validated grouping plus a
/// duration estimate (parallel groups bounded by the slowest group, then
/// the sequential tail end to end).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub parallel_groups: Vec<PlannedGroup>,
    pub sequential: Vec<String>,
    pub estimated_duration_ms: u64,
}

/// Merged record written once per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub session_id: String,
    pub results: Vec<TaskResult>,
    pub succeeded: usize,
    pub failed: usize,
}

/// What one maintenance sweep removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired_messages: usize,
    pub expired_intermediates: usize,
    pub expired_snapshots: usize,
    pub evicted_results: usize,
}

/// Owns the scheduler, registry and store; the embedding agent talks to
/// this and to [`AsyncTaskRegistry`], nothing else.
pub struct ExecutionOrchestrator {
    store: Arc<dyn Store>,
    tracker: TaskStatusTracker,
    scheduler: ParallelScheduler,
    registry: AsyncTaskRegistry,
    config: CoreConfig,
}

impl ExecutionOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        executors: Arc<ExecutorRegistry>,
        config: CoreConfig,
    ) -> Self {
        Self {
            tracker: TaskStatusTracker::new(store.clone()),
            scheduler: ParallelScheduler::new(store.clone(), executors.clone(), config.clone()),
            registry: AsyncTaskRegistry::new(store.clone(), executors, config.clone()),
            store,
            config,
        }
    }

    pub fn registry(&self) -> &AsyncTaskRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &TaskStatusTracker {
        &self.tracker
    }

    /// Validate a batch and describe how it would execute.
    ///
    /// Rejects empty batches, duplicate ids, dependencies on ids outside the
    /// batch, and dependency cycles.
    pub fn plan(&self, tasks: &[Task]) -> Result<ExecutionPlan> {
        if tasks.is_empty() {
            return Err(CoreError::NoValidTasks);
        }

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for task in tasks {
            if indices.contains_key(task.id.as_str()) {
                return Err(CoreError::InvalidWorkflow(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
            indices.insert(&task.id, graph.add_node(task.id.clone()));
        }
        for task in tasks {
            for dep in &task.dependencies {
                let Some(&dep_idx) = indices.get(dep.as_str()) else {
                    return Err(CoreError::InvalidWorkflow(format!(
                        "task {} depends on unknown task {dep}",
                        task.id
                    )));
                };
                graph.add_edge(dep_idx, indices[task.id.as_str()], ());
            }
        }
        toposort(&graph, None)
            .map_err(|_| CoreError::InvalidWorkflow("dependency cycle".to_string()))?;

        let (parallel, sequential) = ParallelScheduler::partition(tasks);
        let parallel_groups: Vec<PlannedGroup> = self
            .scheduler
            .group_parallel(parallel)
            .into_iter()
            .map(|group| PlannedGroup {
                priority: group.priority,
                strategy: group.strategy,
                timeout_ms: group.timeout_ms,
                task_ids: group.tasks.iter().map(|t| t.id.clone()).collect(),
            })
            .collect();

        let parallel_ms = parallel_groups
            .iter()
            .map(|group| group.timeout_ms)
            .max()
            .unwrap_or(0);
        let sequential_ms: u64 = sequential.iter().map(|task| task.timeout_ms).sum();

        Ok(ExecutionPlan {
            parallel_groups,
            sequential: sequential.iter().map(|task| task.id.clone()).collect(),
            estimated_duration_ms: parallel_ms + sequential_ms,
        })
    }

    /// Run a batch end to end: broadcast start, execute through the
    /// scheduler, persist the merged outcome, broadcast completion. On any
    /// error an error broadcast goes out before the error propagates.
    pub async fn run_workflow(&self, tasks: &[Task]) -> Result<WorkflowOutcome> {
        let plan = self.plan(tasks)?;
        let session_id = generate_session_id();

        self.broadcast(
            MessageKind::Status,
            json!({
                "event": "workflow_started",
                "session_id": session_id,
                "tasks": tasks.len(),
                "estimated_duration_ms": plan.estimated_duration_ms,
            }),
        );
        info!(session = %session_id, tasks = tasks.len(), "workflow started");

        let results = match self.scheduler.run_session(tasks, &session_id).await {
            Ok(results) => results,
            Err(err) => {
                self.broadcast(
                    MessageKind::Error,
                    json!({
                        "event": "workflow_failed",
                        "session_id": session_id,
                        "error": err.to_string(),
                    }),
                );
                return Err(err);
            }
        };

        let succeeded = results.iter().filter(|r| r.success).count();
        let outcome = WorkflowOutcome {
            session_id: session_id.clone(),
            failed: results.len() - succeeded,
            succeeded,
            results,
        };
        self.store.put(
            RecordKind::Merged,
            &session_id,
            &serde_json::to_value(&outcome)?,
        )?;

        self.broadcast(
            MessageKind::Status,
            json!({
                "event": "workflow_completed",
                "session_id": session_id,
                "succeeded": outcome.succeeded,
                "failed": outcome.failed,
            }),
        );
        info!(
            session = %session_id,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "workflow completed"
        );
        Ok(outcome)
    }

    /// Notifications visible to `recipient` (addressed plus broadcasts).
    pub fn messages_for(&self, recipient: &str) -> Vec<Message> {
        self.store.scan(&MessageFilter {
            to: Some(recipient.to_string()),
            kind: None,
        })
    }

    /// The whole mailbox, timestamp order.
    pub fn messages(&self) -> Vec<Message> {
        self.store.scan(&MessageFilter::default())
    }

    /// TTL sweep over mailbox, intermediate results and snapshots, plus the
    /// registry's result cache. Safe to call from a periodic timer; never
    /// fails the host.
    pub fn maintenance(&self) -> MaintenanceReport {
        let now = chrono::Utc::now().timestamp_millis();

        let expired_messages = self
            .store
            .sweep_messages(&|message| now - message.timestamp_ms > self.config.message_ttl_ms);

        // Intermediates carry their own expiry; fall back to the write
        // timestamp when the payload is unreadable.
        let intermediate_ttl = self.config.intermediate_ttl_ms;
        let expired_intermediates =
            self.store
                .sweep_expired(RecordKind::Intermediate, &|record| {
                    match record.value.get("expires_at_ms").and_then(|v| v.as_i64()) {
                        Some(expires_at_ms) => now > expires_at_ms,
                        None => now - record.timestamp_ms > intermediate_ttl,
                    }
                });

        let snapshot_ttl = self.config.snapshot_ttl_ms;
        let expired_snapshots = self
            .store
            .sweep_expired(RecordKind::Context, &|record| {
                now - record.timestamp_ms > snapshot_ttl
            });

        let evicted_results = self
            .registry
            .cleanup_completed(self.config.result_cache_max_age_ms);

        let report = MaintenanceReport {
            expired_messages,
            expired_intermediates,
            expired_snapshots,
            evicted_results,
        };
        info!(?report, "maintenance sweep");
        report
    }

    fn broadcast(&self, kind: MessageKind, data: serde_json::Value) {
        let message = Message::new(kind, "orchestrator", data);
        if let Err(err) = self.store.append(&message) {
            warn!(%err, "failed to append broadcast message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use crate::store::MemoryStore;
    use crate::task::TaskType;
    use serde_json::Value;

    fn orchestrator() -> (ExecutionOrchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(FnExecutor(|task: Task| async move {
            if task.config.get("fail").and_then(Value::as_bool) == Some(true) {
                return Err(CoreError::Executor {
                    task_id: task.id.clone(),
                    message: "simulated failure".to_string(),
                });
            }
            Ok(json!({"done": task.name}))
        }));
        let mut executors = ExecutorRegistry::new();
        for task_type in [TaskType::Collect, TaskType::Post, TaskType::Custom] {
            executors.register(task_type, executor.clone());
        }
        (
            ExecutionOrchestrator::new(store.clone(), Arc::new(executors), CoreConfig::default()),
            store,
        )
    }

    #[test]
    fn test_plan_groups_and_estimate() {
        let (orchestrator, _) = orchestrator();
        let tasks = vec![
            Task::new("a", TaskType::Collect)
                .with_id("a")
                .with_priority(Priority::High)
                .with_timeout_ms(10_000),
            Task::new("b", TaskType::Collect)
                .with_id("b")
                .with_timeout_ms(20_000),
            Task::new("c", TaskType::Post)
                .with_id("c")
                .with_timeout_ms(5_000)
                .with_dependencies(vec!["a".to_string()]),
        ];

        let plan = orchestrator.plan(&tasks).unwrap();
        assert_eq!(plan.parallel_groups.len(), 2);
        assert_eq!(plan.parallel_groups[0].strategy, JoinStrategy::All);
        assert_eq!(plan.parallel_groups[1].strategy, JoinStrategy::Settled);
        assert_eq!(plan.sequential, vec!["c".to_string()]);
        // Slowest group (20s) plus the sequential tail (5s)
        assert_eq!(plan.estimated_duration_ms, 25_000);
    }

    #[test]
    fn test_plan_rejects_unknown_dependency() {
        let (orchestrator, _) = orchestrator();
        let tasks = vec![Task::new("a", TaskType::Custom)
            .with_id("a")
            .with_dependencies(vec!["missing".to_string()])];

        let err = orchestrator.plan(&tasks).unwrap_err();
        assert!(matches!(err, CoreError::InvalidWorkflow(_)));
    }

    #[test]
    fn test_plan_rejects_cycle_and_duplicates() {
        let (orchestrator, _) = orchestrator();
        let cycle = vec![
            Task::new("a", TaskType::Custom)
                .with_id("a")
                .with_dependencies(vec!["b".to_string()]),
            Task::new("b", TaskType::Custom)
                .with_id("b")
                .with_dependencies(vec!["a".to_string()]),
        ];
        assert!(matches!(
            orchestrator.plan(&cycle).unwrap_err(),
            CoreError::InvalidWorkflow(_)
        ));

        let dupes = vec![
            Task::new("a", TaskType::Custom).with_id("a"),
            Task::new("a again", TaskType::Custom).with_id("a"),
        ];
        assert!(matches!(
            orchestrator.plan(&dupes).unwrap_err(),
            CoreError::InvalidWorkflow(_)
        ));
    }

    #[test]
    fn test_plan_rejects_empty_batch() {
        let (orchestrator, _) = orchestrator();
        assert!(matches!(
            orchestrator.plan(&[]).unwrap_err(),
            CoreError::NoValidTasks
        ));
    }

    #[tokio::test]
    async fn test_run_workflow_merges_and_broadcasts() {
        let (orchestrator, store) = orchestrator();
        let tasks = vec![
            Task::new("a", TaskType::Collect).with_id("a"),
            Task::new("b", TaskType::Collect)
                .with_id("b")
                .with_config(json!({"fail": true})),
        ];

        let outcome = orchestrator.run_workflow(&tasks).await.unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);

        let merged = store
            .get(RecordKind::Merged, &outcome.session_id)
            .unwrap();
        assert_eq!(merged["succeeded"], 1);

        let events: Vec<String> = store
            .scan(&MessageFilter::default())
            .into_iter()
            .filter_map(|message| {
                message
                    .data
                    .get("event")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();
        assert_eq!(events, vec!["workflow_started", "workflow_completed"]);
    }

    #[tokio::test]
    async fn test_failed_workflow_broadcasts_error() {
        let (orchestrator, store) = orchestrator();
        // High priority puts the failing task in an `all` group, which throws
        let tasks = vec![
            Task::new("bad", TaskType::Collect)
                .with_id("bad")
                .with_priority(Priority::High)
                .with_config(json!({"fail": true})),
            Task::new("ok", TaskType::Collect)
                .with_id("ok")
                .with_priority(Priority::High),
        ];

        let err = orchestrator.run_workflow(&tasks).await.unwrap_err();
        assert!(matches!(err, CoreError::Executor { .. }));

        let errors = store.scan(&MessageFilter {
            to: None,
            kind: Some(MessageKind::Error),
        });
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["event"], "workflow_failed");
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_expired() {
        let (orchestrator, store) = orchestrator();
        let now = chrono::Utc::now().timestamp_millis();

        // Already-expired intermediate, live snapshot
        store
            .put(
                RecordKind::Intermediate,
                "intermediate-t1-x",
                &json!({"expires_at_ms": now - 1_000}),
            )
            .unwrap();
        store
            .put(RecordKind::Context, "context-t1-x", &json!({}))
            .unwrap();

        let report = orchestrator.maintenance();
        assert_eq!(report.expired_intermediates, 1);
        assert_eq!(report.expired_snapshots, 0);
        assert!(store
            .get(RecordKind::Intermediate, "intermediate-t1-x")
            .is_none());
        assert!(store.get(RecordKind::Context, "context-t1-x").is_some());
    }
}
