use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use taskloop::config::Config;
use taskloop::core::{Task, TaskQueue};
use taskloop::execution::{CommandExecutor, Executor};
use taskloop::orchestration::{LoopResult, LoopRunner, RunnerEvent};
use taskloop::state::QueueStore;
use taskloop::stream::NormalizedEvent;
use taskloop::Result;

const DEFAULT_QUEUE_PATH: &str = ".taskloop/queue.json";

/// taskloop - run a dependency-ordered task queue through an agent backend
#[derive(Parser, Debug)]
#[command(name = "taskloop")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    TASKLOOP_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.taskloop/taskloop.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Queue document
    #[arg(short = 'q', long, default_value = DEFAULT_QUEUE_PATH)]
    pub queue: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the loop until the queue completes, blocks or runs out of iterations
    Run {
        /// Dispatch up to --max-parallel ready tasks per iteration
        #[arg(long)]
        parallel: bool,

        #[arg(long)]
        max_parallel: Option<usize>,

        /// Fixed iteration budget (default: 1.2 x incomplete tasks)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Working directory handed to the backend (default: current directory)
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Print the final result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show queue progress and the last checkpoint
    Status,

    /// Append tasks from a JSON file (an array of tasks or {"tasks": [...]})
    Add {
        file: PathBuf,

        /// Spec the tasks belong to
        #[arg(long, default_value = "default")]
        spec: String,
    },

    /// Return entries left running by a crashed run to the queue
    Reconcile,

    /// Check the queue document for unknown dependencies and cycles
    Validate,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    taskloop::log::init_with_debug(cli.debug)?;
    info!(command = ?cli.command, queue = %cli.queue.display(), "taskloop starting");

    let rt = tokio::runtime::Runtime::new()?;
    let store = QueueStore::new(&cli.queue);

    match cli.command {
        Command::Run {
            parallel,
            max_parallel,
            max_iterations,
            work_dir,
            json,
        } => {
            let mut config = Config::load()?;
            config.parallel |= parallel;
            if let Some(max_parallel) = max_parallel {
                config.max_parallel = max_parallel;
            }
            if max_iterations.is_some() {
                config.max_iterations = max_iterations;
            }
            config.validate()?;
            let work_dir = match work_dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let result = rt.block_on(run_loop(config, store, work_dir))?;
            print_result(&result, json)?;
            if !result.all_complete {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status => rt.block_on(run_status(&store)),
        Command::Add { file, spec } => rt.block_on(run_add(&store, &file, &spec)),
        Command::Reconcile => rt.block_on(run_reconcile(&store)),
        Command::Validate => rt.block_on(run_validate(&store)),
    }
}

async fn run_loop(config: Config, store: QueueStore, work_dir: PathBuf) -> Result<LoopResult> {
    let queue = store.load_queue().await?;
    let executor: Arc<dyn Executor> = Arc::new(CommandExecutor::new(config.command_config()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut runner = LoopRunner::new(queue, executor, config.runner_config(work_dir))
        .with_store(store)
        .with_events(tx);
    if let Some(max_iterations) = config.max_iterations {
        runner = runner.with_max_iterations(max_iterations);
    }

    let handle = runner.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            handle.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = runner.run().await;
    drop(runner);
    let _ = printer.await;
    result
}

fn print_event(event: &RunnerEvent) {
    match event {
        RunnerEvent::IterationStart {
            iteration,
            max_iterations,
            current_task_ids,
        } => {
            let ids: Vec<&str> = current_task_ids.iter().map(|id| id.as_str()).collect();
            println!(
                "=== iteration {}/{}: {} ===",
                iteration,
                max_iterations,
                ids.join(", ")
            );
        }
        RunnerEvent::IterationEnd {
            iteration,
            task_completed_ids,
            ..
        } => {
            println!(
                "--- iteration {} done, {} task(s) completed",
                iteration,
                task_completed_ids.len()
            );
        }
        RunnerEvent::Status {
            iteration,
            running_task_ids,
            ..
        } => {
            println!(
                "... iteration {} still running {} task(s)",
                iteration,
                running_task_ids.len()
            );
        }
        RunnerEvent::TaskFinished {
            task_id,
            success,
            duration_ms,
            ..
        } => {
            let status = if *success { "ok" } else { "FAILED" };
            println!("[{}] {} ({} ms)", task_id, status, duration_ms);
        }
        RunnerEvent::Stream { task_id, event } => match event {
            NormalizedEvent::ToolCall { name, detail, .. } => {
                println!("[{}] {} {}", task_id, name, detail)
            }
            NormalizedEvent::Text { content } => println!("[{}] {}", task_id, content),
            _ => {}
        },
        RunnerEvent::TaskStarted { .. } => {}
    }
}

fn print_result(result: &LoopResult, json: bool) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "allComplete": result.all_complete,
            "stop": result.stop,
            "iterationsRun": result.iterations_run,
            "tasksCompleted": result.tasks_completed,
            "queueComplete": result.queue_complete,
            "queue": result.final_queue,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("  Stopped:     {}", result.stop);
    println!("  Iterations:  {}", result.iterations_run);
    println!("  Completed:   {}", result.tasks_completed);
    if result.all_complete && !result.queue_complete {
        println!("  Note:        backend reported completion with open queue entries");
    }
    Ok(())
}

async fn run_status(store: &QueueStore) -> Result<()> {
    let queue = store.load_queue().await?;
    let stats = queue.stats();

    println!("Queue: {}", store.queue_path().display());
    if let Some(project) = queue.project_name() {
        println!("  Project:     {}", project);
    }
    println!("  Total:       {}", stats.total);
    println!("  Completed:   {}", stats.completed);
    println!("  Ready:       {}", stats.ready);
    println!("  Blocked:     {}", stats.blocked);
    println!("  Running:     {}", stats.running);
    println!("  Failed:      {}", stats.failed);
    println!("  Skipped:     {}", stats.skipped);

    if stats.ready == 0 && queue.pending_count() > 0 {
        if let Some(reason) = queue.blocking_reason() {
            println!("  Waiting:     {}", reason);
        }
    }

    if let Some(checkpoint) = store.load_checkpoint().await? {
        println!();
        println!(
            "Last run {}: iteration {}/{} ({:?}) at {}",
            checkpoint.run_id.short(),
            checkpoint.iteration,
            checkpoint.max_iterations,
            checkpoint.state,
            checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

async fn run_add(store: &QueueStore, file: &Path, spec: &str) -> Result<()> {
    let contents = tokio::fs::read_to_string(file).await?;
    let tasks = match serde_json::from_str::<TaskFile>(&contents)? {
        TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
    };

    let mut queue = store.load_queue().await?;
    let inserted = queue.add_tasks(tasks, spec)?;
    store.save_queue(&queue).await?;

    println!("Added {} task(s) to {}", inserted.len(), spec);
    for id in inserted {
        println!("  {}", id);
    }
    Ok(())
}

async fn run_reconcile(store: &QueueStore) -> Result<()> {
    let mut queue: TaskQueue = store.load_queue().await?;
    let demoted = queue.reconcile();
    if demoted.is_empty() {
        println!("Nothing to reconcile");
        return Ok(());
    }
    store.save_queue(&queue).await?;
    println!("Requeued {} stale task(s):", demoted.len());
    for id in demoted {
        println!("  {}", id);
    }
    Ok(())
}

async fn run_validate(store: &QueueStore) -> Result<()> {
    let queue = store.load_queue().await?;
    queue.check_dependencies()?;
    println!("Queue OK: {} task(s), dependencies resolve", queue.len());
    Ok(())
}
