//! Orchestration layer for taskloop.
//!
//! This module drives the queue: it owns the iteration loop, the shared
//! iteration budget and run handle, the retry policy, and the progress
//! events emitted while a run is in flight.

mod budget;
mod events;
mod retry;
mod runner;

pub use budget::{budget_for, IterationBudget, RunHandle};
pub use events::RunnerEvent;
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use runner::{LoopResult, LoopRunner, RunnerConfig, StopReason, DEFAULT_STATUS_INTERVAL_SECS};
