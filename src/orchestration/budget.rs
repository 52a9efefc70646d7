//! Iteration budget and the run handle callers use to steer a live run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Iterations granted for `incomplete` outstanding tasks: `ceil(incomplete * 1.2)`.
pub fn budget_for(incomplete: usize) -> u32 {
    let budget = (incomplete as u64 * 6 + 4) / 5;
    u32::try_from(budget).unwrap_or(u32::MAX)
}

/// Shared, monotonically raisable iteration limit.
///
/// The runner re-reads it before every iteration, so raising it from another
/// task extends a run in flight.
#[derive(Debug, Clone, Default)]
pub struct IterationBudget(Arc<AtomicU32>);

impl IterationBudget {
    pub fn new(max_iterations: u32) -> Self {
        Self(Arc::new(AtomicU32::new(max_iterations)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Overwrite the limit.
    pub fn set(&self, max_iterations: u32) {
        self.0.store(max_iterations, Ordering::SeqCst);
    }

    /// Raise the limit to `max_iterations` if it is higher. Returns the new limit.
    pub fn raise_to(&self, max_iterations: u32) -> u32 {
        let previous = self.0.fetch_max(max_iterations, Ordering::SeqCst);
        previous.max(max_iterations)
    }
}

/// Handle to a run: its budget and its cancellation token.
///
/// Cloned out of the runner before `run` starts; every clone steers the same run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub budget: IterationBudget,
    pub cancel: CancellationToken,
}

impl RunHandle {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            budget: IterationBudget::new(max_iterations),
            cancel: CancellationToken::new(),
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.budget.get()
    }

    /// The number of incomplete tasks changed; grow the budget to match.
    ///
    /// The budget is never lowered.
    pub fn on_tasks_changed(&self, incomplete: usize) -> u32 {
        let budget = self.budget.raise_to(budget_for(incomplete));
        info!(incomplete, max_iterations = budget, "iteration budget updated");
        budget
    }

    /// Request an interrupt. In-flight executions are cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
