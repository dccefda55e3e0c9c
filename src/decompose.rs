use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::scheduler::ParallelScheduler;
use crate::status::{StatusUpdate, TaskStatusTracker};
use crate::store::{RecordKind, Store};
use crate::task::{Task, TaskResult, TaskType};

/// Partial payload persisted after each completed subtask. Swept by
/// maintenance once `expires_at_ms` passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateResult {
    pub id: String,
    pub task_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub expires_at_ms: i64,
}

/// Point-in-time execution state, one per subtask completion. The latest
/// snapshot for a task id is what resume reads back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: Value,
    pub checkpoint: String,
    pub progress: u8,
}

/// Splits tasks whose estimated runtime exceeds the bound into an ordered
/// sequence of bounded subtasks, executes them strictly in index order with
/// a durable checkpoint after each, and combines the payloads type-wise.
#[derive(Clone)]
pub struct LongRunningDecomposer {
    store: Arc<dyn Store>,
    tracker: TaskStatusTracker,
    scheduler: ParallelScheduler,
    config: CoreConfig,
}

impl LongRunningDecomposer {
    pub fn new(store: Arc<dyn Store>, scheduler: ParallelScheduler, config: CoreConfig) -> Self {
        Self {
            tracker: TaskStatusTracker::new(store.clone()),
            store,
            scheduler,
            config,
        }
    }

    /// A task is long-running when its timeout exceeds the threshold or it
    /// carries an estimate / predefined decomposition.
    pub fn qualifies(&self, task: &Task) -> bool {
        task.timeout_ms > self.config.long_running_threshold_ms
            || task.estimated_duration_ms.is_some()
            || task.predefined_subtasks.is_some()
    }

    /// Build the ordered subtask sequence. Predefined subtasks are used
    /// verbatim; otherwise `ceil(estimate / max_subtask_duration)` subtasks
    /// are generated from the type's phase template, inheriting the parent's
    /// priority and bounded by the subtask duration.
    pub fn split(&self, task: &Task) -> Vec<Task> {
        if let Some(subtasks) = &task.predefined_subtasks {
            return subtasks.clone();
        }

        let estimate = task
            .estimated_duration_ms
            .unwrap_or(task.timeout_ms)
            .max(1);
        let bound = self.config.max_subtask_duration_ms.max(1);
        let count = estimate.div_ceil(bound) as usize;

        (0..count)
            .map(|index| {
                Task::new(phase_name(task, index, count), task.task_type)
                    .with_id(format!("{}-sub-{}", task.id, index + 1))
                    .with_priority(task.priority)
                    .with_timeout_ms(bound)
                    .with_config(json!({
                        "parent": task.id,
                        "phase": index + 1,
                        "of": count,
                        "parent_config": task.config,
                    }))
            })
            .collect()
    }

    /// Execute the subtask loop. Subtask i+1 never starts before subtask i's
    /// checkpoint is durably persisted. A failure aborts the loop, marks the
    /// parent failed, and leaves completed checkpoints behind for resume.
    /// `cancel` is checked before each subtask and forwarded to the running
    /// one, so cancelling the parent stops the loop cooperatively.
    pub async fn run(&self, task: &Task, cancel: CancellationToken) -> Result<TaskResult> {
        let subtasks = self.split(task);
        if subtasks.is_empty() {
            return Err(CoreError::InvalidWorkflow(format!(
                "task {} decomposed into zero subtasks",
                task.id
            )));
        }
        let count = subtasks.len();
        let session_id = format!("longrun-{}", task.id);
        let started = Instant::now();

        match self.tracker.get(&task.id) {
            Some(status) if status.state.is_active() => {}
            _ => {
                self.tracker.create(&task.id)?;
            }
        }
        self.tracker.update(&task.id, StatusUpdate::running())?;
        info!(task_id = %task.id, subtasks = count, "decomposed long-running task");

        let mut results = Vec::with_capacity(count);
        let mut checkpoints = Vec::with_capacity(count);

        for (index, subtask) in subtasks.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(task_id = %task.id, step = index + 1, "decomposition cancelled");
                self.tracker
                    .update(&task.id, StatusUpdate::failed("cancelled"))?;
                return Ok(TaskResult::failed(
                    &task.id,
                    "cancelled",
                    started.elapsed().as_millis() as u64,
                ));
            }

            // Child token: a subtask timeout cancels only that subtask,
            // while cancelling the parent reaches the running subtask.
            let result = self
                .scheduler
                .execute_with_timeout(
                    subtask,
                    self.config.max_subtask_duration_ms,
                    &session_id,
                    cancel.child_token(),
                )
                .await?;

            if !result.success {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "subtask failed".to_string());
                warn!(
                    task_id = %task.id,
                    subtask = %subtask.id,
                    step = index + 1,
                    "aborting decomposition"
                );
                self.tracker.update(
                    &task.id,
                    StatusUpdate::failed(format!(
                        "subtask {}/{} failed: {reason}",
                        index + 1,
                        count
                    )),
                )?;
                return Ok(TaskResult::failed(
                    &task.id,
                    format!("subtask {}/{} failed: {reason}", index + 1, count),
                    started.elapsed().as_millis() as u64,
                ));
            }

            let progress = (((index + 1) as f64 / count as f64) * 100.0).round() as u8;
            let checkpoint = format!(
                "{}_step_{}_of_{}_{}%",
                subtask.name,
                index + 1,
                count,
                progress
            );
            self.persist_checkpoint(&task.id, &checkpoint, &result, progress)?;
            self.tracker
                .update(&task.id, StatusUpdate::progress(progress))?;

            checkpoints.push(checkpoint);
            results.push(result);
        }

        let combined = combine(task.task_type, &results, &checkpoints);
        self.tracker.update(&task.id, StatusUpdate::completed())?;

        let outcome = TaskResult::ok(&task.id, combined, started.elapsed().as_millis() as u64);
        self.store.put(
            RecordKind::SessionResult,
            &format!("{session_id}/result-{}", task.id),
            &serde_json::to_value(&outcome)?,
        )?;
        Ok(outcome)
    }

    fn persist_checkpoint(
        &self,
        task_id: &str,
        checkpoint: &str,
        result: &TaskResult,
        progress: u8,
    ) -> Result<()> {
        let now = Utc::now();
        let data = result.data.clone().unwrap_or(Value::Null);

        let intermediate = IntermediateResult {
            id: short_id(),
            task_id: task_id.to_string(),
            data: data.clone(),
            timestamp: now,
            expires_at_ms: now.timestamp_millis() + self.config.intermediate_ttl_ms,
        };
        self.store.put(
            RecordKind::Intermediate,
            &format!("intermediate-{task_id}-{}", intermediate.id),
            &serde_json::to_value(&intermediate)?,
        )?;

        let snapshot = ContextSnapshot {
            id: short_id(),
            task_id: task_id.to_string(),
            timestamp: now,
            state: data,
            checkpoint: checkpoint.to_string(),
            progress,
        };
        self.store.put(
            RecordKind::Context,
            &format!("context-{task_id}-{}", snapshot.id),
            &serde_json::to_value(&snapshot)?,
        )?;
        Ok(())
    }

    /// Recovery view over persisted checkpoints: find the snapshot carrying
    /// `checkpoint` and pair it with the latest intermediate payload. This
    /// does not re-enter the subtask loop; callers resubmit remaining work
    /// explicitly.
    pub fn resume_from_checkpoint(&self, task_id: &str, checkpoint: &str) -> Result<TaskResult> {
        let snapshot = self
            .store
            .list(RecordKind::Context, &format!("context-{task_id}-"))
            .into_iter()
            .filter_map(|record| serde_json::from_value::<ContextSnapshot>(record.value).ok())
            .filter(|snapshot| snapshot.checkpoint == checkpoint)
            .next_back()
            .ok_or_else(|| {
                CoreError::NotFound(format!("checkpoint {checkpoint} for task {task_id}"))
            })?;

        let partial = self
            .store
            .latest(RecordKind::Intermediate, &format!("intermediate-{task_id}-"))
            .and_then(|record| {
                serde_json::from_value::<IntermediateResult>(record.value).ok()
            })
            .ok_or_else(|| {
                CoreError::NotFound(format!("intermediate results for task {task_id}"))
            })?;

        Ok(TaskResult::ok(
            task_id,
            json!({
                "resumed": true,
                "checkpoint": snapshot.checkpoint,
                "progress": snapshot.progress,
                "state": snapshot.state,
                "partial": partial.data,
            }),
            0,
        ))
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string().split('-').next().unwrap().to_string()
}

/// Phase names per task type. Templates shorter than the subtask count
/// repeat their final phase.
fn phase_name(task: &Task, index: usize, count: usize) -> String {
    let phases: &[&str] = match task.task_type {
        TaskType::Collect => &["collection phase"],
        TaskType::Analyze => &[
            "data preparation",
            "basic analysis",
            "deep analysis",
            "integration",
        ],
        TaskType::Strategy => &["assessment", "planning", "optimization", "readiness"],
        TaskType::Post | TaskType::Custom => &["part"],
    };
    let phase = phases[index.min(phases.len() - 1)];
    format!("{} {} {}/{}", task.name, phase, index + 1, count)
}

/// Merge subtask payloads type-specifically and attach the run summary.
fn combine(task_type: TaskType, results: &[TaskResult], checkpoints: &[String]) -> Value {
    let payloads: Vec<Value> = results
        .iter()
        .map(|result| result.data.clone().unwrap_or(Value::Null))
        .collect();

    let mut combined = match task_type {
        TaskType::Collect => combine_collected(&payloads, results),
        TaskType::Analyze | TaskType::Strategy => json!({
            "phases": checkpoints
                .iter()
                .zip(&payloads)
                .map(|(checkpoint, data)| json!({"checkpoint": checkpoint, "data": data}))
                .collect::<Vec<_>>(),
            "final": payloads.last().cloned().unwrap_or(Value::Null),
        }),
        TaskType::Post | TaskType::Custom => json!({ "parts": payloads }),
    };

    let succeeded = results.iter().filter(|result| result.success).count();
    let total_duration: u64 = results.iter().map(|result| result.duration_ms).sum();
    let summary = json!({
        "success_rate": succeeded as f64 / results.len().max(1) as f64,
        "average_subtask_duration_ms": total_duration / results.len().max(1) as u64,
        "checkpoints": checkpoints,
    });
    if let Some(object) = combined.as_object_mut() {
        object.insert("summary".to_string(), summary);
    }
    combined
}

/// Collection payloads: flatten `items`, dedupe `sources` preserving first
/// occurrence, and compute the covered time range.
fn combine_collected(payloads: &[Value], results: &[TaskResult]) -> Value {
    let mut items = vec![];
    let mut sources: Vec<String> = vec![];
    for payload in payloads {
        if let Some(list) = payload.get("items").and_then(Value::as_array) {
            items.extend(list.iter().cloned());
        }
        let found: Vec<String> = match payload.get("sources") {
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => payload
                .get("source")
                .and_then(Value::as_str)
                .map(|s| vec![s.to_string()])
                .unwrap_or_default(),
        };
        for source in found {
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
    }

    let mut object = Map::new();
    object.insert("items".to_string(), Value::Array(items));
    object.insert(
        "sources".to_string(),
        Value::Array(sources.into_iter().map(Value::String).collect()),
    );
    if let (Some(first), Some(last)) = (results.first(), results.last()) {
        object.insert(
            "time_range".to_string(),
            json!({
                "start": first.timestamp,
                "end": last.timestamp,
            }),
        );
    }
    Value::Object(object)
}
