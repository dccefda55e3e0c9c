pub mod config;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod message;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod task;

pub use config::CoreConfig;
pub use decompose::{ContextSnapshot, IntermediateResult, LongRunningDecomposer};
pub use error::{CoreError, Result};
pub use executor::{ExecutorRegistry, FnExecutor, SimulatedExecutor, TaskExecutor};
pub use message::{Message, MessageFilter, MessageKind};
pub use orchestrator::{
    ExecutionOrchestrator, ExecutionPlan, MaintenanceReport, PlannedGroup, WorkflowOutcome,
};
pub use registry::{AsyncTaskRegistry, WaitMode};
pub use scheduler::{JoinStrategy, ParallelGroup, ParallelScheduler};
pub use status::{StatusUpdate, TaskState, TaskStatus, TaskStatusTracker};
pub use store::{FileStore, MemoryStore, Record, RecordKind, Store};
pub use task::{Priority, Task, TaskResult, TaskType};
