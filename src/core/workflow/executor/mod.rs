#![allow(clippy::result_large_err)] // Executors return AppError directly for structured diagnostics without boxing.

pub mod action;
pub mod human;
pub mod parallel;

pub use action::{ActionExecutor, ActionHandler, BuiltinAction};
pub use human::{HumanAction, HumanInLoopExecutor, HumanResponse, HumanReviewRequest};
pub use parallel::ParallelBatchExecutor;

use crate::core::error::AppError;
use crate::core::workflow::schema::Step;
use crate::core::workflow::state::ExecutionContext;
use async_trait::async_trait;
use serde_json::Value;

/// One step variant. The engine asks executors in registration order and
/// delegates to the first whose `supports` accepts the step.
#[async_trait]
pub trait StepExecutor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn supports(&self, step: &Step) -> bool;

    /// True when the executor enforces its own timer, so the engine must not
    /// race it against the step deadline.
    fn owns_deadline(&self) -> bool {
        false
    }

    /// Run one step with its input already resolved against the run variables.
    async fn execute(
        &self,
        step: &Step,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, AppError>;
}
