#![allow(clippy::result_large_err)] // Definition validation returns AppError so callers keep the WFG-DEF code.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::input::InputNode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Fallback value that turns a human review timeout into an approval.
pub const AUTO_APPROVE_FALLBACK: &str = "auto_approve";

/// Static description of a process: trigger, ordered steps and hooks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Optional only so that a missing trigger surfaces as a validation error.
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, alias = "on_error", skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Step>,
    #[serde(default, alias = "on_complete", skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<Step>,
}

/// What starts a workflow.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl Trigger {
    pub fn manual() -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            channel: None,
            event: None,
            schedule: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ImMessage,
    Webhook,
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::ImMessage => "im_message",
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }
}

/// Step variant. Unrecognised names are kept as `Custom` so that executors
/// registered by the host can claim them.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    #[default]
    Action,
    Parallel,
    HumanInLoop,
    Custom(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            StepType::Action => "action",
            StepType::Parallel => "parallel",
            StepType::HumanInLoop => "human_in_loop",
            StepType::Custom(name) => name,
        }
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "action" => StepType::Action,
            "parallel" => StepType::Parallel,
            "human_in_loop" => StepType::HumanInLoop,
            _ => StepType::Custom(value),
        }
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        match value {
            StepType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a definition.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Executor hint passed through to action handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub input: InputNode,
    /// Variable that receives the step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Variable reference iterated once per element with `item` rebound.
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_over: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Step {
    /// Plain action step with no input.
    pub fn action(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn parallel(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Parallel,
            steps,
            ..Default::default()
        }
    }

    pub fn human(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::HumanInLoop,
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<InputNode>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<Value>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn with_loop(mut self, source: impl Into<String>) -> Self {
        self.loop_over = Some(source.into());
        self
    }

    /// True when a review timeout on this step should count as approval.
    pub fn auto_approves_on_timeout(&self) -> bool {
        match self.fallback.as_ref().and_then(Value::as_str) {
            Some(value) => value == AUTO_APPROVE_FALLBACK || value == "auto-approve",
            None => false,
        }
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, trigger: Trigger, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: None,
            trigger: Some(trigger),
            steps,
            on_error: Vec::new(),
            on_complete: Vec::new(),
        }
    }

    pub fn with_on_error(mut self, steps: Vec<Step>) -> Self {
        self.on_error = steps;
        self
    }

    pub fn with_on_complete(mut self, steps: Vec<Step>) -> Self {
        self.on_complete = steps;
        self
    }

    /// Validate definition invariants before the engine accepts it.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(definition_error("Workflow must have a name", "WFG-DEF-001"));
        }
        if self.trigger.is_none() {
            return Err(definition_error(
                format!("Workflow {} must have a trigger", self.name),
                "WFG-DEF-002",
            ));
        }
        if self.steps.is_empty() {
            return Err(definition_error(
                format!("Workflow {} must have at least one step", self.name),
                "WFG-DEF-003",
            ));
        }
        // One name space for top-level steps, nested groups and both hook lists.
        let mut seen = HashSet::new();
        for step in self
            .steps
            .iter()
            .chain(self.on_error.iter())
            .chain(self.on_complete.iter())
        {
            validate_step(step, &self.name, &mut seen)?;
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding, as lowercase hex.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

fn validate_step<'a>(
    step: &'a Step,
    workflow: &str,
    seen: &mut HashSet<&'a str>,
) -> Result<(), AppError> {
    if step.name.trim().is_empty() {
        return Err(definition_error(
            format!("Workflow {} has a step without a name", workflow),
            "WFG-DEF-005",
        ));
    }
    if !seen.insert(step.name.as_str()) {
        return Err(definition_error(
            format!("Duplicate step name: {} in workflow {}", step.name, workflow),
            "WFG-DEF-004",
        ));
    }
    if step.step_type == StepType::Parallel {
        if step.steps.is_empty() {
            return Err(definition_error(
                format!("Parallel step {} has no sub-steps", step.name),
                "WFG-DEF-005",
            ));
        }
        for sub_step in &step.steps {
            validate_step(sub_step, workflow, seen)?;
        }
    }
    Ok(())
}

fn definition_error(message: impl Into<String>, code: &str) -> AppError {
    AppError::new(ErrorCategory::DefinitionError, message).with_code(code)
}
