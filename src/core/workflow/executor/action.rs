use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::executor::StepExecutor;
use crate::core::workflow::schema::{Step, StepType};
use crate::core::workflow::state::ExecutionContext;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Host-supplied business action.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn handle(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, AppError>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    async fn handle(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, AppError> {
        (self)(input, ctx.clone()).await
    }
}

/// Actions every engine understands without registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinAction {
    /// Returns `{"status": "ok"}`.
    Noop,
    /// Logs the step content (or input) and returns `{"logged": true}`.
    Log,
    /// Sleeps `input.duration` milliseconds, 1000 by default.
    Wait,
    /// Echoes the resolved input so it can be bound to a variable.
    Set,
}

const DEFAULT_WAIT_MS: u64 = 1_000;

impl BuiltinAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinAction::Noop => "noop",
            BuiltinAction::Log => "log",
            BuiltinAction::Wait => "wait",
            BuiltinAction::Set => "set",
        }
    }

    async fn run(&self, step: &Step, input: Value, ctx: &ExecutionContext) -> Value {
        match self {
            BuiltinAction::Noop => json!({"status": "ok"}),
            BuiltinAction::Log => {
                let message = match (&step.content, &input) {
                    (Some(content), _) => content.clone(),
                    (None, Value::String(text)) => text.clone(),
                    (None, other) => other.to_string(),
                };
                tracing::info!(
                    execution_id = %ctx.execution_id,
                    workflow = %ctx.workflow_name,
                    step = %step.name,
                    "[workflow log] {}",
                    message
                );
                json!({"logged": true})
            }
            BuiltinAction::Wait => {
                let duration = input
                    .get("duration")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_WAIT_MS);
                tokio::time::sleep(Duration::from_millis(duration)).await;
                json!({"waited": duration, "completedAt": Utc::now().to_rfc3339()})
            }
            BuiltinAction::Set => input,
        }
    }
}

impl FromStr for BuiltinAction {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "noop" => Ok(BuiltinAction::Noop),
            "log" => Ok(BuiltinAction::Log),
            "wait" => Ok(BuiltinAction::Wait),
            "set" => Ok(BuiltinAction::Set),
            _ => Err(()),
        }
    }
}

/// Default variant: dispatches `step.action` to a registered handler or a built-in.
#[derive(Default)]
pub struct ActionExecutor {
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host action. Registered names shadow built-ins.
    pub fn register_action<H: ActionHandler>(&self, name: impl Into<String>, handler: H) {
        self.register_shared(name, Arc::new(handler));
    }

    pub fn register_shared(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(action = %name, "replacing previously registered action");
        }
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.handlers.contains_key(name) || BuiltinAction::from_str(name).is_ok()
    }
}

#[async_trait]
impl StepExecutor for ActionExecutor {
    fn name(&self) -> &'static str {
        "action"
    }

    fn supports(&self, step: &Step) -> bool {
        step.step_type == StepType::Action
    }

    async fn execute(
        &self,
        step: &Step,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, AppError> {
        let action = step.action.as_deref().ok_or_else(|| {
            AppError::new(
                ErrorCategory::DefinitionError,
                format!("Step {} has no action specified", step.name),
            )
            .with_code("WFG-ACT-001")
        })?;

        // Clone the handler out so the map shard is not held across the await.
        let handler = self.handlers.get(action).map(|entry| Arc::clone(entry.value()));
        if let Some(handler) = handler {
            tracing::debug!(step = %step.name, action, agent = ?step.agent, "running registered action");
            return handler.handle(input, ctx).await;
        }

        match BuiltinAction::from_str(action) {
            Ok(builtin) => Ok(builtin.run(step, input, ctx).await),
            Err(()) => Err(AppError::new(
                ErrorCategory::DefinitionError,
                format!("Unknown action: {}", action),
            )
            .with_code("WFG-ACT-002")),
        }
    }
}
