//! Core domain models for taskloop.
//!
//! This module contains the task model, the dependency graph used to
//! validate task sets, and the position-ordered queue the runner pulls from.

pub mod dag;
pub mod queue;
pub mod task;

pub use dag::DependencyGraph;
pub use queue::{
    BlockedReason, EntryStatus, QueueCounters, QueueDocument, QueueEntry, QueueStats, TaskQueue,
};
pub use task::{Complexity, Task, TaskId};
