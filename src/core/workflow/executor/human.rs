#![allow(clippy::result_large_err)] // Review outcomes map onto AppError codes the engine records verbatim.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::events::{EventSink, WorkflowEvent};
use crate::core::workflow::executor::StepExecutor;
use crate::core::workflow::schema::{Step, StepType};
use crate::core::workflow::state::ExecutionContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Reviewer decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanAction {
    Approve,
    Reject,
    Modify,
    Timeout,
}

impl HumanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HumanAction::Approve => "approve",
            HumanAction::Reject => "reject",
            HumanAction::Modify => "modify",
            HumanAction::Timeout => "timeout",
        }
    }
}

impl FromStr for HumanAction {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "approve" => Ok(HumanAction::Approve),
            "reject" => Ok(HumanAction::Reject),
            "modify" => Ok(HumanAction::Modify),
            "timeout" => Ok(HumanAction::Timeout),
            _ => Err("must be one of 'approve', 'reject', 'modify' or 'timeout'"),
        }
    }
}

impl std::fmt::Display for HumanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decisions a reviewer may take on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOptions {
    pub approve: bool,
    pub reject: bool,
    pub modify: bool,
}

impl Default for ReviewOptions {
    fn default() -> Self {
        Self {
            approve: true,
            reject: true,
            modify: true,
        }
    }
}

/// Published when a run suspends on a human checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanReviewRequest {
    pub execution_id: String,
    pub workflow_name: String,
    pub step_name: String,
    pub requested_at: DateTime<Utc>,
    /// Milliseconds before the request times out; `None` waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Resolved step input under review.
    pub data: Value,
    pub options: ReviewOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Reviewer answer delivered through `HumanInLoopExecutor::submit_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanResponse {
    pub action: HumanAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub responded_at: DateTime<Utc>,
}

impl HumanResponse {
    fn with_action(action: HumanAction) -> Self {
        Self {
            action,
            modified_data: None,
            reason: None,
            responded_by: None,
            responded_at: Utc::now(),
        }
    }

    pub fn approve() -> Self {
        Self::with_action(HumanAction::Approve)
    }

    pub fn reject(reason: Option<&str>) -> Self {
        Self {
            reason: reason.map(str::to_string),
            ..Self::with_action(HumanAction::Reject)
        }
    }

    pub fn modify(data: Value) -> Self {
        Self {
            modified_data: Some(data),
            ..Self::with_action(HumanAction::Modify)
        }
    }

    pub fn timeout() -> Self {
        Self::with_action(HumanAction::Timeout)
    }

    pub fn responded_by(mut self, reviewer: impl Into<String>) -> Self {
        self.responded_by = Some(reviewer.into());
        self
    }
}

type ReviewKey = (String, String);

struct PendingReview {
    request: HumanReviewRequest,
    responder: oneshot::Sender<HumanResponse>,
}

/// Removes the registry entry on every exit path of a wait, including the
/// waiting future being dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<ReviewKey, PendingReview>,
    key: ReviewKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// Suspends a run until a reviewer answers or the review times out.
///
/// Outstanding requests live in a registry keyed by `(execution_id, step_name)`
/// with a oneshot channel as the wait handle. The executor owns its deadline:
/// the step `timeout` (or the configured review timeout) drives its timer and
/// the engine does not race it.
pub struct HumanInLoopExecutor {
    pending: DashMap<ReviewKey, PendingReview>,
    events: Arc<dyn EventSink>,
    default_timeout_ms: u64,
}

impl HumanInLoopExecutor {
    pub fn new(events: Arc<dyn EventSink>, default_timeout_ms: u64) -> Self {
        Self {
            pending: DashMap::new(),
            events,
            default_timeout_ms,
        }
    }

    /// Deliver a reviewer decision to the run waiting on `(execution_id, step_name)`.
    pub fn submit_response(
        &self,
        execution_id: &str,
        step_name: &str,
        response: HumanResponse,
    ) -> Result<(), AppError> {
        let key = (execution_id.to_string(), step_name.to_string());
        let Some((_, review)) = self.pending.remove(&key) else {
            tracing::warn!(execution_id, step = step_name, "no pending review request");
            return Err(not_pending(execution_id, step_name));
        };
        tracing::info!(
            execution_id,
            step = step_name,
            action = %response.action,
            responded_by = ?response.responded_by,
            "human response received"
        );
        review.responder.send(response).map_err(|_| {
            tracing::warn!(execution_id, step = step_name, "review waiter already gone");
            not_pending(execution_id, step_name)
        })
    }

    /// Outstanding requests, oldest first.
    pub fn pending_requests(&self) -> Vec<HumanReviewRequest> {
        let mut requests: Vec<HumanReviewRequest> = self
            .pending
            .iter()
            .map(|entry| entry.value().request.clone())
            .collect();
        requests.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        requests
    }

    pub fn has_pending(&self, execution_id: &str, step_name: &str) -> bool {
        self.pending
            .contains_key(&(execution_id.to_string(), step_name.to_string()))
    }

    fn timeout_for(&self, step: &Step) -> u64 {
        step.timeout_ms.unwrap_or(self.default_timeout_ms)
    }

    fn outcome(step: &Step, input: Value, response: HumanResponse) -> Result<Value, AppError> {
        match response.action {
            HumanAction::Approve => Ok(json!({
                "approved": true,
                "data": input,
                "approvedAt": response.responded_at,
            })),
            HumanAction::Modify => Ok(json!({
                "approved": true,
                "modified": true,
                "data": response.modified_data.unwrap_or(Value::Null),
                "approvedAt": response.responded_at,
            })),
            HumanAction::Reject => {
                let reason = response
                    .reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or("No reason provided");
                Err(AppError::new(
                    ErrorCategory::HumanRejection,
                    format!("Human rejected: {}", reason),
                )
                .with_code("WFG-HIL-001"))
            }
            HumanAction::Timeout if step.auto_approves_on_timeout() => {
                tracing::warn!(step = %step.name, "human review timed out, auto-approving");
                Ok(json!({
                    "approved": true,
                    "autoApproved": true,
                    "data": input,
                    "reason": "Timeout - auto approved",
                }))
            }
            HumanAction::Timeout => Err(AppError::new(
                ErrorCategory::TimeoutError,
                "Human review timed out",
            )
            .with_code("WFG-HIL-002")),
        }
    }
}

fn not_pending(execution_id: &str, step_name: &str) -> AppError {
    AppError::new(
        ErrorCategory::ValidationError,
        format!("No pending review for {}:{}", execution_id, step_name),
    )
    .with_code("WFG-HIL-404")
}

#[async_trait]
impl StepExecutor for HumanInLoopExecutor {
    fn name(&self) -> &'static str {
        "human_in_loop"
    }

    fn supports(&self, step: &Step) -> bool {
        step.step_type == StepType::HumanInLoop
    }

    fn owns_deadline(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        step: &Step,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, AppError> {
        let timeout_ms = self.timeout_for(step);
        let key: ReviewKey = (ctx.execution_id.clone(), step.name.clone());
        let request = HumanReviewRequest {
            execution_id: ctx.execution_id.clone(),
            workflow_name: ctx.workflow_name.clone(),
            step_name: step.name.clone(),
            requested_at: Utc::now(),
            timeout_ms: (timeout_ms > 0).then_some(timeout_ms),
            data: input.clone(),
            options: ReviewOptions::default(),
            channel: step.channel.clone(),
            content: step.content.clone(),
        };

        let (responder, receiver) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!(
                        "Review already pending for {}:{}",
                        ctx.execution_id, step.name
                    ),
                )
                .with_code("WFG-HIL-003"));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingReview {
                    request: request.clone(),
                    responder,
                });
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            key,
        };

        tracing::info!(
            execution_id = %ctx.execution_id,
            workflow = %ctx.workflow_name,
            step = %step.name,
            timeout_ms,
            "waiting for human review"
        );
        self.events.emit(WorkflowEvent::ReviewRequested(request));

        let answered = if timeout_ms == 0 {
            receiver.await.ok()
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), receiver)
                .await
                .ok()
                .and_then(Result::ok)
        };
        let response = answered.unwrap_or_else(HumanResponse::timeout);
        Self::outcome(step, input, response)
    }
}
