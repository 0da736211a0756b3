#![allow(clippy::result_large_err)] // Engine returns AppError to preserve full diagnostic context; boxing would discard run-time state.

use crate::core::config::EngineConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::events::{EventSink, NullEventSink, WorkflowEvent};
use crate::core::workflow::executor::{
    ActionExecutor, ActionHandler, HumanInLoopExecutor, HumanResponse, HumanReviewRequest,
    ParallelBatchExecutor, StepExecutor,
};
use crate::core::workflow::expression::ExpressionEngine;
use crate::core::workflow::persistence::{FileRunRepository, RunRecord, RunRepository, StepRecord};
use crate::core::workflow::schema::{Step, WorkflowDefinition};
use crate::core::workflow::state::{
    ExecutionContext, ExecutionState, RunResult, RunStatus, StepResult, StepStatus,
    LOOP_ITEM_VARIABLE,
};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A step failure that escaped its fallback, tagged with the failing step.
struct StepFailure {
    step: String,
    error: AppError,
}

/// Assembles a [`WorkflowEngine`] with its collaborators.
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    repository: Option<Arc<dyn RunRepository>>,
    events: Option<Arc<dyn EventSink>>,
    actions: Option<Arc<ActionExecutor>>,
}

impl WorkflowEngineBuilder {
    /// Persist runs through `repository`. Without one (and without
    /// `state_dir` configured) the engine skips persistence.
    pub fn with_repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share an action table that the host populated up front.
    pub fn with_action_executor(mut self, actions: Arc<ActionExecutor>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(NullEventSink) as Arc<dyn EventSink>);
        let repository = self.repository.or_else(|| {
            self.config.state_dir.as_ref().map(|dir| {
                Arc::new(FileRunRepository::new(dir.clone())) as Arc<dyn RunRepository>
            })
        });
        let actions = self.actions.unwrap_or_default();
        let human = Arc::new(HumanInLoopExecutor::new(
            Arc::clone(&events),
            self.config.human_review_timeout_ms,
        ));
        let executors: Vec<Arc<dyn StepExecutor>> = vec![
            Arc::clone(&actions) as Arc<dyn StepExecutor>,
            Arc::clone(&human) as Arc<dyn StepExecutor>,
        ];
        WorkflowEngine {
            parallel: ParallelBatchExecutor::new(self.config.max_parallel_steps),
            config: self.config,
            definitions: RwLock::new(HashMap::new()),
            actions,
            human,
            executors: RwLock::new(executors),
            repository,
            events,
            expressions: Arc::new(ExpressionEngine::default()),
        }
    }
}

/// Runs workflow definitions.
///
/// Each call to [`WorkflowEngine::execute`] owns its own [`ExecutionState`];
/// runs share only the definition table and the executor registry. Steps of a
/// run execute in declaration order except inside parallel groups.
/// Reloading a definition while a run of the same name is active is not
/// supported: the run keeps the definition it started with.
pub struct WorkflowEngine {
    config: EngineConfig,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    actions: Arc<ActionExecutor>,
    human: Arc<HumanInLoopExecutor>,
    parallel: ParallelBatchExecutor,
    executors: RwLock<Vec<Arc<dyn StepExecutor>>>,
    repository: Option<Arc<dyn RunRepository>>,
    events: Arc<dyn EventSink>,
    expressions: Arc<ExpressionEngine>,
}

impl WorkflowEngine {
    pub fn builder(config: EngineConfig) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config,
            repository: None,
            events: None,
            actions: None,
        }
    }

    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and store a definition, replacing any previous one of that name.
    pub fn load_definition(&self, definition: WorkflowDefinition) -> Result<(), AppError> {
        definition.validate()?;
        tracing::info!(
            workflow = %definition.name,
            steps = definition.steps.len(),
            "loaded workflow definition"
        );
        let mut guard = self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Validate every definition first; nothing is stored if any is invalid.
    pub fn load_all<I>(&self, definitions: I) -> Result<usize, AppError>
    where
        I: IntoIterator<Item = WorkflowDefinition>,
    {
        let definitions: Vec<WorkflowDefinition> = definitions.into_iter().collect();
        for definition in &definitions {
            definition.validate()?;
        }
        let count = definitions.len();
        let mut guard = self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for definition in definitions {
            guard.insert(definition.name.clone(), Arc::new(definition));
        }
        tracing::info!(count, total = guard.len(), "loaded workflow definitions");
        Ok(count)
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        let guard = self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(name).cloned()
    }

    /// Names of the loaded definitions, sorted.
    pub fn workflow_names(&self) -> Vec<String> {
        let guard = self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }

    /// Append a custom executor; it is consulted after the built-ins.
    pub fn register_executor(&self, executor: Arc<dyn StepExecutor>) {
        tracing::debug!(executor = executor.name(), "registered step executor");
        let mut guard = self
            .executors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(executor);
    }

    pub fn register_action<H: ActionHandler>(&self, name: impl Into<String>, handler: H) {
        self.actions.register_action(name, handler);
    }

    /// Resolve a suspended human checkpoint.
    pub fn submit_human_response(
        &self,
        execution_id: &str,
        step_name: &str,
        response: HumanResponse,
    ) -> Result<(), AppError> {
        self.human.submit_response(execution_id, step_name, response)
    }

    pub fn pending_human_reviews(&self) -> Vec<HumanReviewRequest> {
        self.human.pending_requests()
    }

    /// Run `workflow_name` to completion.
    ///
    /// Only an unknown workflow name is an `Err`; every run that starts ends in
    /// an `Ok(RunResult)` whatever its terminal status.
    pub async fn execute(&self, workflow_name: &str, payload: Value) -> Result<RunResult, AppError> {
        let definition = self.definition(workflow_name).ok_or_else(|| {
            AppError::new(
                ErrorCategory::DefinitionError,
                format!("Workflow {} not found", workflow_name),
            )
            .with_code("WFG-RUN-404")
        })?;

        let trigger_type = definition
            .trigger
            .as_ref()
            .map(|trigger| trigger.trigger_type.as_str())
            .unwrap_or("manual");
        let context = ExecutionContext::new(definition.name.clone(), trigger_type, payload);
        let mut state = ExecutionState::with_expressions(context, Arc::clone(&self.expressions));
        let mut record = RunRecord::running(
            state.execution_id(),
            definition.name.clone(),
            state.context().trigger.clone(),
            state.started_at(),
        )
        .with_fingerprint(definition.fingerprint());
        self.persist_run(&record).await;

        tracing::info!(
            execution_id = %state.execution_id(),
            workflow = %definition.name,
            "starting workflow execution"
        );

        let mut outcome = self.run_steps(&definition.steps, &mut state).await;
        if outcome.is_ok() {
            outcome = self.run_steps(&definition.on_complete, &mut state).await;
        }

        match outcome {
            Ok(()) => {
                state.set_status(RunStatus::Completed);
                tracing::info!(
                    execution_id = %state.execution_id(),
                    workflow = %definition.name,
                    "workflow execution completed"
                );
            }
            Err(failure) => {
                tracing::error!(
                    execution_id = %state.execution_id(),
                    workflow = %definition.name,
                    step = %failure.step,
                    code = %failure.error.code,
                    "workflow execution failed: {}",
                    failure.error.message
                );
                state.set_error(
                    failure.error.message.clone(),
                    failure.step,
                    Some(failure.error.trace()),
                );
                if failure.error.code == "WFG-HIL-002" {
                    state.set_status(RunStatus::Timeout);
                }
                if !definition.on_error.is_empty() {
                    tracing::info!(
                        execution_id = %state.execution_id(),
                        "executing error handling steps"
                    );
                    if let Err(handler) = self.run_steps(&definition.on_error, &mut state).await {
                        tracing::error!(
                            execution_id = %state.execution_id(),
                            step = %handler.step,
                            "error handler failed: {}",
                            handler.error.message
                        );
                    }
                }
            }
        }

        let result = state.result();
        if let Err(err) = record.finish(&result) {
            tracing::warn!(execution_id = %result.execution_id, "{}", err);
        }
        self.persist_run(&record).await;
        self.events
            .emit(WorkflowEvent::RunCompleted(Box::new(result.clone())));
        if self.config.enable_metrics {
            report_metrics(&result);
        }
        Ok(result)
    }

    async fn run_steps(
        &self,
        steps: &[Step],
        state: &mut ExecutionState,
    ) -> Result<(), StepFailure> {
        for step in steps {
            self.execute_step(step, state)
                .await
                .map_err(|error| StepFailure {
                    step: step.name.clone(),
                    error,
                })?;
        }
        Ok(())
    }

    /// Single-step path shared by top-level steps, hooks and parallel sub-steps.
    fn execute_step<'a>(
        &'a self,
        step: &'a Step,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        async move {
            let started_at = Utc::now();

            if let Some(condition) = step.condition.as_deref() {
                if !state.evaluate_condition(condition) {
                    tracing::debug!(
                        execution_id = %state.execution_id(),
                        step = %step.name,
                        condition,
                        "skipping step, condition not met"
                    );
                    let result = StepResult::skipped(step.name.clone(), started_at);
                    let mut record =
                        StepRecord::from_result(state.execution_id(), step.step_type.clone(), &result);
                    record.input = Some(state.resolve_input(&step.input));
                    self.persist_step(&record).await;
                    state.record_step_result(result);
                    return Ok(());
                }
            }

            tracing::debug!(
                execution_id = %state.execution_id(),
                step = %step.name,
                step_type = %step.step_type,
                "executing step"
            );

            let input = state.resolve_input(&step.input);
            let outcome = if self.parallel.supports(step) {
                self.parallel
                    .run(step, state, |sub_step, child| self.run_branch(sub_step, child))
                    .await
            } else {
                self.dispatch(step, &input, state).await
            };
            self.settle(step, state, started_at, input, outcome).await
        }
        .boxed()
    }

    /// Run one parallel sub-step on a forked state, yielding the value bound to its name.
    fn run_branch<'a>(
        &'a self,
        step: &'a Step,
        mut child: ExecutionState,
    ) -> BoxFuture<'a, (ExecutionState, Result<Value, AppError>)> {
        async move {
            let outcome = self
                .execute_step(step, &mut child)
                .await
                .map(|()| child.get(&step.name).unwrap_or(Value::Null));
            (child, outcome)
        }
        .boxed()
    }

    async fn dispatch(
        &self,
        step: &Step,
        input: &Value,
        state: &mut ExecutionState,
    ) -> Result<Value, AppError> {
        let executor = self.find_executor(step).ok_or_else(|| {
            AppError::new(
                ErrorCategory::DefinitionError,
                format!(
                    "No executor found for step {} (type: {})",
                    step.name, step.step_type
                ),
            )
            .with_code("WFG-EXEC-001")
        })?;
        let deadline = if executor.owns_deadline() {
            None
        } else {
            self.config.step_deadline(step.timeout_ms)
        };

        let Some(source) = step.loop_over.as_deref() else {
            return run_with_deadline(executor.as_ref(), step, input.clone(), state.context(), deadline)
                .await;
        };
        let items = match state.get(source) {
            Some(Value::Array(items)) => items,
            _ => {
                tracing::debug!(step = %step.name, source, "loop source is not a list");
                return Ok(Value::Array(Vec::new()));
            }
        };
        let mut outputs = Vec::with_capacity(items.len());
        for item in items {
            state.set(LOOP_ITEM_VARIABLE, item);
            let item_input = state.resolve_input(&step.input);
            outputs.push(
                run_with_deadline(executor.as_ref(), step, item_input, state.context(), deadline)
                    .await?,
            );
        }
        Ok(Value::Array(outputs))
    }

    /// Record the outcome of a step and apply its output binding or fallback.
    async fn settle(
        &self,
        step: &Step,
        state: &mut ExecutionState,
        started_at: DateTime<Utc>,
        input: Value,
        outcome: Result<Value, AppError>,
    ) -> Result<(), AppError> {
        match outcome {
            Ok(output) => {
                let result =
                    StepResult::completed(step.name.clone(), started_at, Some(input), output.clone());
                self.persist_step(&StepRecord::from_result(
                    state.execution_id(),
                    step.step_type.clone(),
                    &result,
                ))
                .await;
                state.record_step_result(result);
                if let Some(variable) = &step.output {
                    state.set(variable.clone(), output);
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    execution_id = %state.execution_id(),
                    step = %step.name,
                    code = %err.code,
                    "step failed: {}",
                    err.message
                );
                let result = if err.category == ErrorCategory::TimeoutError {
                    StepResult::timed_out(step.name.clone(), started_at, Some(input), err.message.clone())
                } else {
                    StepResult::failed(step.name.clone(), started_at, Some(input), err.message.clone())
                };
                self.persist_step(&StepRecord::from_result(
                    state.execution_id(),
                    step.step_type.clone(),
                    &result,
                ))
                .await;
                state.record_step_result(result);

                match &step.fallback {
                    Some(fallback) => {
                        tracing::info!(
                            execution_id = %state.execution_id(),
                            step = %step.name,
                            "using fallback value"
                        );
                        state.set(step.name.clone(), fallback.clone());
                        Ok(())
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn find_executor(&self, step: &Step) -> Option<Arc<dyn StepExecutor>> {
        let guard = self
            .executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .iter()
            .find(|executor| executor.supports(step))
            .cloned()
    }

    async fn persist_run(&self, record: &RunRecord) {
        if let Some(repository) = &self.repository {
            if let Err(err) = repository.create_or_update(record).await {
                tracing::warn!(
                    execution_id = %record.execution_id,
                    "failed to persist run record: {}",
                    err
                );
            }
        }
    }

    async fn persist_step(&self, record: &StepRecord) {
        if let Some(repository) = &self.repository {
            if let Err(err) = repository.save_step(record).await {
                tracing::warn!(
                    execution_id = %record.execution_id,
                    step = %record.step_name,
                    "failed to persist step record: {}",
                    err
                );
            }
        }
    }
}

async fn run_with_deadline(
    executor: &dyn StepExecutor,
    step: &Step,
    input: Value,
    ctx: &ExecutionContext,
    deadline: Option<Duration>,
) -> Result<Value, AppError> {
    let run = executor.execute(step, input, ctx);
    let Some(limit) = deadline else {
        return run.await;
    };
    match tokio::time::timeout(limit, run).await {
        Ok(outcome) => outcome,
        Err(_) => Err(AppError::new(
            ErrorCategory::TimeoutError,
            format!("Step {} timed out after {}ms", step.name, limit.as_millis()),
        )
        .with_code("WFG-TIME-001")),
    }
}

fn report_metrics(result: &RunResult) {
    let count = |status: StepStatus| result.steps.iter().filter(|s| s.status == status).count();
    tracing::info!(
        target: "conduit::metrics",
        workflow = %result.workflow_name,
        execution_id = %result.execution_id,
        status = result.status.as_str(),
        duration_ms = result.duration_ms,
        steps = result.steps.len(),
        completed = count(StepStatus::Completed),
        failed = count(StepStatus::Failed),
        timed_out = count(StepStatus::Timeout),
        skipped = count(StepStatus::Skipped),
        "workflow metrics"
    );
}
