//! Integration test suite for taskloop.
//!
//! These tests exercise the queue, the loop runner, persistence and the
//! subprocess backend together.
//!
//! # Test Categories
//!
//! - `loop_runner`: Iteration semantics against a scripted backend
//! - `queue_persistence`: Queue documents, checkpoints and crash recovery
//! - `command_executor`: The subprocess backend driven by `sh` scripts
//!
//! # CI Compatibility
//!
//! No test talks to a real agent backend; the subprocess tests only need `sh`.


mod command_executor;
mod loop_runner;
