//! # Executors
//!
//! What the event loop runs when a selectable is dispatched. An [`Executor`]
//! is a [`Selectable`] with two async hooks: `execute` after the multiplexer
//! picked it, and `sweep` once per loop iteration regardless of what was
//! picked.

pub mod batched;
pub mod handler;
pub mod retry;

use async_trait::async_trait;

use crate::error::OrchBusResult;
use crate::select::Selectable;

pub use batched::{BatchedConsumptionLoop, ExecutorStats};
pub use handler::{Constraint, TaskHandler, TaskOutcome};
pub use retry::{RetryNotifier, RetryQueue};

/// A selectable the event loop can run
#[async_trait]
pub trait Executor: Selectable {
    /// Process the work that made this selectable ready
    async fn execute(&mut self) -> OrchBusResult<()>;

    /// Progress work that has no event of its own, such as resolved retries
    async fn sweep(&mut self) -> OrchBusResult<()>;
}
