use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::schema::{Step, StepType};
use crate::core::workflow::state::ExecutionState;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::future::Future;

/// Fan-out/fan-in for `parallel` groups.
///
/// Sub-steps run in batches of at most `max_parallel_steps`; a batch must
/// settle before the next one starts. Each sub-step runs on a forked state and
/// the forks are merged back in declaration order once their batch settles.
/// Sub-step failures do not fail the group: they surface as `{"error": ..}`
/// entries in the aggregate output.
#[derive(Debug, Clone, Copy)]
pub struct ParallelBatchExecutor {
    max_parallel_steps: usize,
}

impl ParallelBatchExecutor {
    pub fn new(max_parallel_steps: usize) -> Self {
        Self {
            max_parallel_steps: max_parallel_steps.max(1),
        }
    }

    pub fn max_parallel_steps(&self) -> usize {
        self.max_parallel_steps
    }

    pub fn supports(&self, step: &Step) -> bool {
        step.step_type == StepType::Parallel
    }

    pub fn batches<'a>(&self, steps: &'a [Step]) -> std::slice::Chunks<'a, Step> {
        steps.chunks(self.max_parallel_steps)
    }

    /// Drive every batch of `step.steps` through `runner`.
    ///
    /// `runner` receives a sub-step and a forked state and hands the state back
    /// together with the value bound under the sub-step's name.
    pub async fn run<'s, R, Fut>(
        &self,
        step: &'s Step,
        state: &mut ExecutionState,
        runner: R,
    ) -> Result<Value, AppError>
    where
        R: Fn(&'s Step, ExecutionState) -> Fut,
        Fut: Future<Output = (ExecutionState, Result<Value, AppError>)>,
    {
        if step.steps.is_empty() {
            return Err(AppError::new(
                ErrorCategory::DefinitionError,
                format!("Parallel step {} has no sub-steps", step.name),
            )
            .with_code("WFG-PAR-001"));
        }
        if step.steps.len() > self.max_parallel_steps {
            tracing::warn!(
                step = %step.name,
                sub_steps = step.steps.len(),
                max_parallel_steps = self.max_parallel_steps,
                "parallel group exceeds the concurrency limit, executing in batches"
            );
        }

        let mut aggregate = Map::new();
        for (index, batch) in self.batches(&step.steps).enumerate() {
            tracing::debug!(
                step = %step.name,
                batch = index + 1,
                sub_steps = ?batch.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "executing parallel batch"
            );
            let branches = batch.iter().map(|sub_step| runner(sub_step, state.fork()));
            let settled = join_all(branches).await;

            for (sub_step, (child, outcome)) in batch.iter().zip(settled) {
                state.merge(child);
                let value = match outcome {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(
                            step = %step.name,
                            sub_step = %sub_step.name,
                            "parallel sub-step failed: {}",
                            err.message
                        );
                        json!({"error": err.message})
                    }
                };
                aggregate.insert(sub_step.name.clone(), value);
            }
        }
        Ok(Value::Object(aggregate))
    }
}
