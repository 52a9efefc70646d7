//! Progress events emitted by the loop runner.

use serde::Serialize;

use crate::core::task::TaskId;
use crate::stream::NormalizedEvent;

/// Events emitted by the runner for iteration and task lifecycle changes.
///
/// Delivered over an unbounded channel so a slow consumer never stalls a
/// run. Serialized with a kebab-case `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunnerEvent {
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        current_task_ids: Vec<TaskId>,
    },
    IterationEnd {
        iteration: u32,
        /// Every queue entry has completed.
        all_complete: bool,
        task_completed_ids: Vec<TaskId>,
    },
    /// Periodic heartbeat while a batch is running.
    Status {
        iteration: u32,
        max_iterations: u32,
        running_task_ids: Vec<TaskId>,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskFinished {
        task_id: TaskId,
        success: bool,
        is_complete: bool,
        duration_ms: u64,
    },
    /// One normalized backend event for a running task.
    Stream {
        task_id: TaskId,
        event: NormalizedEvent,
    },
}
