//! taskloop: iterative, dependency-ordered task execution.
//!
//! A [`TaskQueue`](core::TaskQueue) holds tasks in insertion order and
//! computes which of them are ready. The
//! [`LoopRunner`](orchestration::LoopRunner) dispatches ready tasks to an
//! [`Executor`](execution::Executor) in barrier-synchronized iterations, and
//! the [`stream`] layer normalizes backend output so the runner can tell
//! when the backend says all work is done.

pub mod config;
pub mod core;
pub mod error;
pub mod execution;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod stream;

pub use error::{Error, Result};
