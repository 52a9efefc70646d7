//! Loop runner: drives the queue to completion one iteration at a time.
//!
//! Each iteration pulls the ready set from the queue (one task in sequential
//! mode, up to `max_parallel` otherwise), runs the whole batch concurrently
//! and waits for every execution before touching the queue again. There is
//! no mid-batch refill.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::budget::{budget_for, RunHandle};
use super::events::RunnerEvent;
use super::retry::{RetryDecision, RetryPolicy};
use crate::config::MAX_PARALLEL_LIMIT;
use crate::core::queue::{QueueEntry, TaskQueue};
use crate::core::task::{Task, TaskId};
use crate::error::Result;
use crate::execution::{ExecutionResult, Executor};
use crate::state::{Checkpoint, CheckpointState, QueueStore, RunId};
use crate::stream::NormalizedEvent;

/// Default period between `status` events while a batch runs.
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub parallel: bool,
    pub max_parallel: usize,
    /// Attempts per task before it is marked failed. Zero means unlimited.
    pub max_attempts: u32,
    /// Period of `status` events while a batch runs. Zero disables them.
    pub status_interval: Duration,
    /// Stop as soon as the backend declares all work done.
    pub trust_backend_completion: bool,
    pub work_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_parallel: 3,
            max_attempts: super::retry::DEFAULT_MAX_ATTEMPTS,
            status_interval: Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS),
            trust_backend_completion: true,
            work_dir: PathBuf::from("."),
        }
    }
}

impl RunnerConfig {
    /// Tasks dispatched per iteration.
    pub fn batch_size(&self) -> usize {
        if self.parallel {
            self.max_parallel.clamp(1, MAX_PARALLEL_LIMIT)
        } else {
            1
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    /// Nothing is ready but work remains.
    Blocked { task_id: TaskId, unmet: Vec<TaskId> },
    BudgetExhausted,
    /// No work remains and these entries failed for good.
    Failed { task_ids: Vec<TaskId> },
    Interrupted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Complete => write!(f, "complete"),
            StopReason::Blocked { task_id, unmet } => {
                let unmet: Vec<&str> = unmet.iter().map(|id| id.as_str()).collect();
                write!(f, "blocked: {} waits on [{}]", task_id, unmet.join(", "))
            }
            StopReason::BudgetExhausted => write!(f, "iteration budget exhausted"),
            StopReason::Failed { task_ids } => {
                let ids: Vec<&str> = task_ids.iter().map(|id| id.as_str()).collect();
                write!(f, "failed: {}", ids.join(", "))
            }
            StopReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Summary of one runner invocation.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub all_complete: bool,
    pub stop: StopReason,
    pub iterations_run: u32,
    /// Tasks completed during this invocation.
    pub tasks_completed: usize,
    /// No queued, running or failed entries remain. Can be false while
    /// `all_complete` is true when the backend declared completion first.
    pub queue_complete: bool,
    pub final_queue: Vec<QueueEntry>,
}

struct IterationOutcome {
    completed: Vec<TaskId>,
    backend_complete: bool,
}

/// Drives a [`TaskQueue`] through an [`Executor`].
pub struct LoopRunner {
    queue: TaskQueue,
    executor: Arc<dyn Executor>,
    config: RunnerConfig,
    retry: RetryPolicy,
    handle: RunHandle,
    store: Option<QueueStore>,
    events: Option<mpsc::UnboundedSender<RunnerEvent>>,
    run_id: RunId,
}

impl LoopRunner {
    /// The budget starts at `ceil(pending * 1.2)` iterations.
    pub fn new(queue: TaskQueue, executor: Arc<dyn Executor>, config: RunnerConfig) -> Self {
        let handle = RunHandle::new(budget_for(queue.pending_count()));
        let retry = RetryPolicy::new(config.max_attempts);
        Self {
            queue,
            executor,
            config,
            retry,
            handle,
            store: None,
            events: None,
            run_id: RunId::new(),
        }
    }

    /// Persist the queue and checkpoints through `store`.
    pub fn with_store(mut self, store: QueueStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the derived budget with a fixed one. It can still be raised
    /// through the handle.
    pub fn with_max_iterations(self, max_iterations: u32) -> Self {
        self.handle.budget.set(max_iterations);
        self
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Run until complete, blocked, failed, out of budget or interrupted.
    ///
    /// # Errors
    /// `BackendUnavailable` before any work starts, and persistence errors.
    /// Individual execution failures are not errors.
    pub async fn run(&mut self) -> Result<LoopResult> {
        info!(
            run_id = %self.run_id,
            executor = self.executor.name(),
            batch_size = self.config.batch_size(),
            max_iterations = self.handle.max_iterations(),
            "run starting"
        );

        if !self.queue.reconcile().is_empty() {
            self.persist_queue().await?;
        }
        self.executor.check_available()?;

        let mut iteration = 0u32;
        let mut tasks_completed = 0usize;
        let stop = loop {
            if self.handle.is_cancelled() {
                break StopReason::Interrupted;
            }

            let batch = self.queue.get_ready_tasks(self.config.batch_size());
            if batch.is_empty() {
                break self.idle_stop();
            }

            let max_iterations = self.handle.max_iterations();
            if iteration >= max_iterations {
                break StopReason::BudgetExhausted;
            }
            iteration += 1;

            let outcome = self.run_iteration(iteration, max_iterations, &batch).await?;
            tasks_completed += outcome.completed.len();

            if outcome.backend_complete {
                if self.config.trust_backend_completion {
                    if !self.queue_complete() {
                        warn!(
                            pending = self.queue.pending_count(),
                            failed = self.queue.failed_ids().len(),
                            "backend declared completion while queue has open entries"
                        );
                    }
                    break StopReason::Complete;
                }
                debug!("backend completion signal ignored, queue decides");
            }
        };

        self.finish(stop, iteration, tasks_completed).await
    }

    async fn run_iteration(
        &mut self,
        iteration: u32,
        max_iterations: u32,
        batch: &[Task],
    ) -> Result<IterationOutcome> {
        let task_ids: Vec<TaskId> = batch.iter().map(|t| t.id.clone()).collect();
        for id in &task_ids {
            self.queue.mark_running(id)?;
            let attempt = self.queue.entry(id).map_or(0, |e| e.attempts);
            self.emit(RunnerEvent::TaskStarted {
                task_id: id.clone(),
                attempt,
            });
        }

        info!(iteration, max_iterations, tasks = ?task_ids, "iteration start");
        self.emit(RunnerEvent::IterationStart {
            iteration,
            max_iterations,
            current_task_ids: task_ids.clone(),
        });
        self.save_checkpoint(iteration, task_ids, CheckpointState::Running)
            .await?;

        let results = self.dispatch(iteration, batch).await;

        let mut completed = Vec::new();
        let mut backend_complete = false;
        for (task, result) in batch.iter().zip(results) {
            match result {
                Ok(result) => {
                    self.emit(RunnerEvent::TaskFinished {
                        task_id: task.id.clone(),
                        success: result.success,
                        is_complete: result.is_complete,
                        duration_ms: result.duration_ms,
                    });
                    backend_complete |= result.is_complete;
                    self.apply_result(&task.id, &result, &mut completed)?;
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "execution error");
                    self.emit(RunnerEvent::TaskFinished {
                        task_id: task.id.clone(),
                        success: false,
                        is_complete: false,
                        duration_ms: 0,
                    });
                    if self.handle.is_cancelled() {
                        self.queue.release(&task.id)?;
                    } else {
                        self.record_failure(&task.id, &e.to_string())?;
                    }
                }
            }
        }

        self.persist_queue().await?;

        let all_complete = self.queue.all_completed();
        info!(
            iteration,
            completed = completed.len(),
            progress = !completed.is_empty(),
            "iteration end"
        );
        self.emit(RunnerEvent::IterationEnd {
            iteration,
            all_complete,
            task_completed_ids: completed.clone(),
        });

        Ok(IterationOutcome {
            completed,
            backend_complete,
        })
    }

    /// Run the batch to the barrier, emitting `status` heartbeats meanwhile.
    async fn dispatch(&self, iteration: u32, batch: &[Task]) -> Vec<Result<ExecutionResult>> {
        let executions = batch.iter().map(|task| {
            let executor = Arc::clone(&self.executor);
            let cancel = self.handle.cancel.child_token();
            let events = self.events.clone();
            let work_dir = self.config.work_dir.clone();
            async move {
                let task_id = task.id.clone();
                let on_event = move |event: &NormalizedEvent| {
                    if let Some(tx) = &events {
                        let _ = tx.send(RunnerEvent::Stream {
                            task_id: task_id.clone(),
                            event: event.clone(),
                        });
                    }
                };
                executor.run(task, &work_dir, &on_event, cancel).await
            }
        });
        let barrier = join_all(executions);
        tokio::pin!(barrier);

        let period = self.config.status_interval;
        if period.is_zero() {
            return barrier.await;
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let running: Vec<TaskId> = batch.iter().map(|t| t.id.clone()).collect();

        loop {
            tokio::select! {
                results = &mut barrier => return results,
                _ = ticker.tick() => {
                    debug!(iteration, running = running.len(), "status");
                    self.emit(RunnerEvent::Status {
                        iteration,
                        max_iterations: self.handle.max_iterations(),
                        running_task_ids: running.clone(),
                    });
                }
            }
        }
    }

    fn apply_result(
        &mut self,
        id: &TaskId,
        result: &ExecutionResult,
        completed: &mut Vec<TaskId>,
    ) -> Result<()> {
        if result.success || result.is_complete {
            self.queue.mark_completed(id)?;
            info!(task_id = %id, duration_ms = result.duration_ms, "task completed");
            completed.push(id.clone());
            Ok(())
        } else if result.was_cancelled() {
            debug!(task_id = %id, "execution cancelled, requeued");
            self.queue.release(id)
        } else {
            self.record_failure(id, &result.exit.to_string())
        }
    }

    fn record_failure(&mut self, id: &TaskId, cause: &str) -> Result<()> {
        let attempts = self.queue.entry(id).map_or(0, |e| e.attempts);
        match self.retry.decide(attempts) {
            RetryDecision::Requeue => {
                let remaining = self.retry.remaining(attempts);
                warn!(task_id = %id, attempts, ?remaining, cause, "execution failed, requeued");
                self.queue.requeue(id)
            }
            RetryDecision::GiveUp => {
                warn!(task_id = %id, attempts, cause, "execution failed, giving up");
                self.queue.mark_failed(id)
            }
        }
    }

    /// Stop reason when the ready set is empty.
    fn idle_stop(&self) -> StopReason {
        if self.queue.pending_count() == 0 {
            let failed = self.queue.failed_ids();
            return if failed.is_empty() {
                StopReason::Complete
            } else {
                StopReason::Failed { task_ids: failed }
            };
        }
        match self.queue.blocking_reason() {
            Some(reason) => StopReason::Blocked {
                task_id: reason.task_id,
                unmet: reason.unmet,
            },
            // Pending but nothing queued: only running entries, which the
            // loop never leaves behind between iterations.
            None => StopReason::Blocked {
                task_id: self
                    .queue
                    .running_ids()
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| TaskId::new("")),
                unmet: Vec::new(),
            },
        }
    }

    fn queue_complete(&self) -> bool {
        self.queue.pending_count() == 0 && self.queue.failed_ids().is_empty()
    }

    async fn finish(
        &mut self,
        stop: StopReason,
        iterations_run: u32,
        tasks_completed: usize,
    ) -> Result<LoopResult> {
        let state = if stop == StopReason::Interrupted {
            CheckpointState::Interrupted
        } else {
            CheckpointState::Idle
        };
        self.save_checkpoint(iterations_run, Vec::new(), state).await?;

        match &stop {
            StopReason::Complete => info!(iterations_run, tasks_completed, "run complete"),
            other => warn!(iterations_run, tasks_completed, stop = %other, "run stopped"),
        }

        Ok(LoopResult {
            all_complete: stop == StopReason::Complete,
            stop,
            iterations_run,
            tasks_completed,
            queue_complete: self.queue_complete(),
            final_queue: self.queue.snapshot(),
        })
    }

    async fn persist_queue(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save_queue(&self.queue).await,
            None => Ok(()),
        }
    }

    async fn save_checkpoint(
        &self,
        iteration: u32,
        running_task_ids: Vec<TaskId>,
        state: CheckpointState,
    ) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let checkpoint = Checkpoint::new(
            self.run_id,
            iteration,
            self.handle.max_iterations(),
            running_task_ids,
            state,
        );
        store.save_checkpoint(&checkpoint).await
    }

    fn emit(&self, event: RunnerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
