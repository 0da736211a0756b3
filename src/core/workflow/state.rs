use crate::core::workflow::expression::ExpressionEngine;
use crate::core::workflow::input::{InputNode, REFERENCE_MARKER};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Variable rebound on every iteration of a loop step.
pub const LOOP_ITEM_VARIABLE: &str = "item";

/// Trigger information captured when a run starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub data: Value,
}

/// Identity plus the variable bag of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_name: String,
    pub trigger: TriggerData,
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    /// Build a fresh context; `trigger`, `message` and `conversation` are seeded from the payload.
    pub fn new(workflow_name: impl Into<String>, trigger_type: impl Into<String>, payload: Value) -> Self {
        let mut variables = Map::new();
        variables.insert("trigger".to_string(), payload.clone());
        for key in ["message", "conversation"] {
            if let Some(value) = payload.get(key) {
                variables.insert(key.to_string(), value.clone());
            }
        }
        Self {
            execution_id: generate_execution_id(),
            workflow_name: workflow_name.into(),
            trigger: TriggerData {
                trigger_type: trigger_type.into(),
                data: payload,
            },
            variables,
            metadata: Map::new(),
        }
    }
}

pub fn generate_execution_id() -> String {
    format!("exec-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
    Timeout,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Timeout => "timeout",
        }
    }
}

/// Outcome of one step attempt. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn completed(
        step_name: impl Into<String>,
        started_at: DateTime<Utc>,
        input: Option<Value>,
        output: Value,
    ) -> Self {
        Self::finish(step_name, StepStatus::Completed, started_at, input, Some(output), None)
    }

    pub fn failed(
        step_name: impl Into<String>,
        started_at: DateTime<Utc>,
        input: Option<Value>,
        error: impl Into<String>,
    ) -> Self {
        Self::finish(step_name, StepStatus::Failed, started_at, input, None, Some(error.into()))
    }

    pub fn timed_out(
        step_name: impl Into<String>,
        started_at: DateTime<Utc>,
        input: Option<Value>,
        error: impl Into<String>,
    ) -> Self {
        Self::finish(step_name, StepStatus::Timeout, started_at, input, None, Some(error.into()))
    }

    /// Skipped steps always report a zero duration.
    pub fn skipped(step_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            started_at,
            completed_at: Utc::now(),
            duration_ms: 0,
            input: None,
            output: None,
            error: None,
        }
    }

    fn finish(
        step_name: impl Into<String>,
        status: StepStatus,
        started_at: DateTime<Utc>,
        input: Option<Value>,
        output: Option<Value>,
        error: Option<String>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            step_name: step_name.into(),
            status,
            started_at,
            completed_at,
            duration_ms: elapsed_ms(started_at, completed_at),
            input,
            output,
            error,
        }
    }
}

/// Terminal error attached to a failed or cancelled run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    pub message: String,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Final record of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub execution_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    /// Variable snapshot at termination.
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunResult {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|result| result.step_name == name)
    }
}

/// Live bookkeeping for one run: variables, recorded step outcomes, status.
pub struct ExecutionState {
    context: ExecutionContext,
    results: IndexMap<String, StepResult>,
    started_at: DateTime<Utc>,
    status: RunStatus,
    error: Option<RunError>,
    expressions: Arc<ExpressionEngine>,
    /// Keys written since creation, replayed onto the parent by `merge`.
    writes: Vec<String>,
}

impl ExecutionState {
    pub fn new(context: ExecutionContext) -> Self {
        Self::with_expressions(context, Arc::new(ExpressionEngine::default()))
    }

    pub fn with_expressions(context: ExecutionContext, expressions: Arc<ExpressionEngine>) -> Self {
        Self {
            context,
            results: IndexMap::new(),
            started_at: Utc::now(),
            status: RunStatus::Running,
            error: None,
            expressions,
            writes: Vec::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.context.variables.insert(name.clone(), value);
        self.writes.push(name);
    }

    /// Look up a plain name or dotted path, with or without the `$` marker.
    ///
    /// Misses are silent: any absent segment yields `None`. Numeric segments
    /// index arrays and a trailing `length` reports the size of an array,
    /// string or object.
    pub fn get(&self, path: &str) -> Option<Value> {
        let clean = path.trim().trim_start_matches(REFERENCE_MARKER);
        if clean.is_empty() {
            return None;
        }
        let mut segments = clean.split('.');
        let root = segments.next()?;
        let mut current = self.context.variables.get(root)?;
        let mut length_of: Option<usize> = None;
        for segment in segments {
            if length_of.is_some() {
                return None;
            }
            current = match current {
                Value::Object(map) => match map.get(segment) {
                    Some(child) => child,
                    None if segment == "length" => {
                        length_of = Some(map.len());
                        continue;
                    }
                    None => return None,
                },
                Value::Array(items) => {
                    if segment == "length" {
                        length_of = Some(items.len());
                        continue;
                    }
                    items.get(segment.parse::<usize>().ok()?)?
                }
                Value::String(text) if segment == "length" => {
                    length_of = Some(text.chars().count());
                    continue;
                }
                _ => return None,
            };
        }
        match length_of {
            Some(len) => Some(Value::from(len)),
            None => Some(current.clone()),
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.context.variables
    }

    /// Evaluate a step condition. Empty conditions pass; evaluation errors count as false.
    pub fn evaluate_condition(&self, condition: &str) -> bool {
        if condition.trim().is_empty() {
            return true;
        }
        let lookup = |path: &str| self.get(path);
        match self.expressions.evaluate_condition(condition, &lookup) {
            Ok(flag) => flag,
            Err(err) => {
                tracing::warn!(
                    execution_id = %self.context.execution_id,
                    condition,
                    "failed to evaluate condition: {}",
                    err.message
                );
                false
            }
        }
    }

    pub fn resolve_input(&self, input: &InputNode) -> Value {
        let lookup = |path: &str| self.get(path);
        input.resolve(&lookup)
    }

    /// Record a step outcome; its output becomes addressable under the step name.
    pub fn record_step_result(&mut self, result: StepResult) {
        if let Some(output) = &result.output {
            self.set(result.step_name.clone(), output.clone());
        }
        self.results.insert(result.step_name.clone(), result);
    }

    pub fn step_result(&self, step_name: &str) -> Option<&StepResult> {
        self.results.get(step_name)
    }

    pub fn step_results(&self) -> Vec<StepResult> {
        self.results.values().cloned().collect()
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn set_error(&mut self, message: impl Into<String>, step: impl Into<String>, stack: Option<String>) {
        self.error = Some(RunError {
            message: message.into(),
            step: step.into(),
            stack,
        });
        self.status = RunStatus::Failed;
    }

    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    /// Mark the run cancelled. Steps already in flight are not interrupted.
    pub fn cancel(&mut self, reason: Option<&str>) {
        self.status = RunStatus::Cancelled;
        if let Some(reason) = reason {
            self.error = Some(RunError {
                message: reason.to_string(),
                step: "cancelled".to_string(),
                stack: None,
            });
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn execution_id(&self) -> &str {
        &self.context.execution_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Child state over a snapshot of the variables, used for one parallel branch.
    pub fn fork(&self) -> ExecutionState {
        ExecutionState {
            context: self.context.clone(),
            results: IndexMap::new(),
            started_at: Utc::now(),
            status: RunStatus::Running,
            error: None,
            expressions: Arc::clone(&self.expressions),
            writes: Vec::new(),
        }
    }

    /// Replay a child's recorded results and variable writes onto this state.
    pub fn merge(&mut self, child: ExecutionState) {
        let ExecutionState {
            context,
            results,
            writes,
            ..
        } = child;
        for (name, result) in results {
            self.results.insert(name, result);
        }
        for key in writes {
            if let Some(value) = context.variables.get(&key) {
                self.set(key, value.clone());
            }
        }
    }

    pub fn result(&self) -> RunResult {
        let completed_at = Utc::now();
        RunResult {
            execution_id: self.context.execution_id.clone(),
            workflow_name: self.context.workflow_name.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at,
            duration_ms: elapsed_ms(self.started_at, completed_at),
            steps: self.step_results(),
            output: self.context.variables.clone(),
            error: self.error.clone(),
        }
    }
}

pub(crate) fn elapsed_ms(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> u64 {
    completed_at
        .signed_duration_since(started_at)
        .num_milliseconds()
        .max(0) as u64
}
