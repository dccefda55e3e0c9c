use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence::{
    CoreConfig, ExecutionOrchestrator, ExecutorRegistry, FileStore, LongRunningDecomposer,
    ParallelScheduler, SimulatedExecutor, Task, TaskType,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Durable task execution engine", long_about = None)]
struct Cli {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Optional JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory
    Init,

    /// Show how a workflow file would execute, without running it
    Plan {
        /// JSON file containing an array of tasks
        workflow: PathBuf,
    },

    /// Run a workflow file to completion
    Run {
        /// JSON file containing an array of tasks
        workflow: PathBuf,
    },

    /// Show task status (all active tasks, or one task by id)
    Status {
        /// Task ID (omit to list active tasks)
        task_id: Option<String>,
    },

    /// Show notification messages
    Messages {
        /// Only messages visible to this recipient
        #[arg(short, long)]
        to: Option<String>,
    },

    /// Read back a persisted checkpoint of an interrupted task
    Resume {
        /// Task ID
        task_id: String,

        /// Checkpoint label, e.g. "collect mentions collection phase 2/3_step_2_of_3_67%"
        checkpoint: String,
    },

    /// Sweep expired messages, intermediate results and snapshots
    Maintain,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CoreConfig::default(),
    };

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&cli.data_dir)?;
            FileStore::new(&cli.data_dir)?;
            println!("Initialized data directory at {}", cli.data_dir.display());
        }

        Commands::Plan { ref workflow } => {
            let tasks = load_workflow(workflow)?;
            let orch = create_orchestrator(&cli, config)?;
            let plan = orch.plan(&tasks)?;

            println!("Execution plan ({} tasks):", tasks.len());
            for group in &plan.parallel_groups {
                println!(
                    "  {:?} group [{:?}, {}ms]: {}",
                    group.priority,
                    group.strategy,
                    group.timeout_ms,
                    group.task_ids.join(", ")
                );
            }
            if !plan.sequential.is_empty() {
                println!("  sequential: {}", plan.sequential.join(" -> "));
            }
            println!("Estimated duration: {}ms", plan.estimated_duration_ms);
        }

        Commands::Run { ref workflow } => {
            let tasks = load_workflow(workflow)?;
            let orch = create_orchestrator(&cli, config)?;

            let recovered = orch.registry().recover_running("process restarted")?;
            if recovered > 0 {
                println!("Recovered {} stale task(s) from a previous run", recovered);
            }

            println!("Running {} task(s)...", tasks.len());
            let outcome = orch.run_workflow(&tasks).await?;

            println!("\nSession {}:", outcome.session_id);
            for result in &outcome.results {
                let status = if result.success { "✓" } else { "✗" };
                let detail = result.error.as_deref().unwrap_or("");
                println!(
                    "  [{}] {} ({}ms) {}",
                    status, result.task_id, result.duration_ms, detail
                );
            }
            println!(
                "{} succeeded, {} failed",
                outcome.succeeded, outcome.failed
            );
        }

        Commands::Status { ref task_id } => {
            let orch = create_orchestrator(&cli, config)?;
            match task_id {
                Some(id) => match orch.tracker().get(id) {
                    Some(status) => {
                        println!("Task {}:", status.task_id);
                        println!("  State:    {:?}", status.state);
                        println!("  Progress: {}%", status.progress);
                        println!(
                            "  Started:  {}",
                            status.started_at.format("%Y-%m-%d %H:%M:%S")
                        );
                        if let Some(ended) = status.ended_at {
                            println!("  Ended:    {}", ended.format("%Y-%m-%d %H:%M:%S"));
                        }
                        if let Some(error) = &status.error {
                            println!("  Error:    {}", error);
                        }
                    }
                    None => println!("No status found for task: {}", id),
                },
                None => {
                    let active = orch.tracker().list_active();
                    if active.is_empty() {
                        println!("No active tasks.");
                    } else {
                        println!("Active tasks:");
                        for status in active {
                            println!(
                                "  {:?} {} ({}%)",
                                status.state, status.task_id, status.progress
                            );
                        }
                    }
                }
            }
        }

        Commands::Messages { ref to } => {
            let orch = create_orchestrator(&cli, config)?;
            let messages = match to {
                Some(recipient) => orch.messages_for(recipient),
                None => orch.messages(),
            };
            if messages.is_empty() {
                println!("No messages.");
            } else {
                for message in messages {
                    let to = message.to.as_deref().unwrap_or("*");
                    println!(
                        "[{:?}] {} -> {}: {}",
                        message.kind, message.from, to, message.data
                    );
                }
            }
        }

        Commands::Resume {
            ref task_id,
            ref checkpoint,
        } => {
            let store = Arc::new(FileStore::new(&cli.data_dir)?);
            let executors = Arc::new(demo_executors());
            let scheduler = ParallelScheduler::new(store.clone(), executors, config.clone());
            let decomposer = LongRunningDecomposer::new(store, scheduler, config);

            let result = decomposer.resume_from_checkpoint(task_id, checkpoint)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result.data.unwrap_or_default())?
            );
        }

        Commands::Maintain => {
            let orch = create_orchestrator(&cli, config)?;
            let report = orch.maintenance();
            println!("Maintenance sweep:");
            println!("  Expired messages:      {}", report.expired_messages);
            println!("  Expired intermediates: {}", report.expired_intermediates);
            println!("  Expired snapshots:     {}", report.expired_snapshots);
            println!("  Evicted results:       {}", report.evicted_results);
        }
    }

    Ok(())
}

fn load_workflow(path: &PathBuf) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file {}", path.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&content)
        .with_context(|| format!("invalid workflow file {}", path.display()))?;
    Ok(tasks)
}

/// The CLI ships simulated executors; embedding applications register their
/// own implementations instead.
fn demo_executors() -> ExecutorRegistry {
    let executor = Arc::new(SimulatedExecutor);
    let mut registry = ExecutorRegistry::new();
    for task_type in [
        TaskType::Collect,
        TaskType::Analyze,
        TaskType::Post,
        TaskType::Strategy,
        TaskType::Custom,
    ] {
        registry.register(task_type, executor.clone());
    }
    registry
}

fn create_orchestrator(cli: &Cli, config: CoreConfig) -> Result<ExecutionOrchestrator> {
    let store = Arc::new(FileStore::new(&cli.data_dir)?);
    Ok(ExecutionOrchestrator::new(
        store,
        Arc::new(demo_executors()),
        config,
    ))
}
