//! On-disk state for taskloop runs.
//!
//! This module persists the queue document and the per-run checkpoint that
//! records which iteration was in flight when a run stopped.

mod store;

pub use store::{Checkpoint, CheckpointState, QueueStore, RunId};
