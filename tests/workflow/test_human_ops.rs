use conduit::core::config::EngineConfig;
use conduit::core::types::ErrorCategory;
use conduit::core::workflow::events::REVIEW_REQUESTED;
use conduit::core::workflow::{
    EventSink, ExecutionContext, HumanAction, HumanInLoopExecutor, HumanResponse,
    HumanReviewRequest, ListenerEventSink, NullEventSink, RunStatus, Step, StepExecutor,
    StepStatus, Trigger, WorkflowDefinition, WorkflowEngine, WorkflowEvent,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn wait_for_review(executor: &HumanInLoopExecutor) -> HumanReviewRequest {
    for _ in 0..200 {
        if let Some(request) = executor.pending_requests().into_iter().next() {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no review request registered");
}

async fn wait_for_engine_review(engine: &WorkflowEngine) -> HumanReviewRequest {
    for _ in 0..200 {
        if let Some(request) = engine.pending_human_reviews().into_iter().next() {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no review request registered");
}

fn executor(timeout_ms: u64) -> Arc<HumanInLoopExecutor> {
    Arc::new(HumanInLoopExecutor::new(Arc::new(NullEventSink), timeout_ms))
}

fn ctx() -> ExecutionContext {
    ExecutionContext::new("refunds", "webhook", json!({"amount": 120}))
}

#[tokio::test]
async fn test_approve_returns_input_as_data() {
    let executor = executor(0);
    let context = ctx();
    let waiter = {
        let executor = Arc::clone(&executor);
        let context = context.clone();
        tokio::spawn(async move {
            executor
                .execute(&Step::human("review"), json!({"amount": 120}), &context)
                .await
        })
    };

    let request = wait_for_review(&executor).await;
    assert_eq!(request.execution_id, context.execution_id);
    assert_eq!(request.step_name, "review");
    assert_eq!(request.data, json!({"amount": 120}));
    assert_eq!(request.timeout_ms, None);

    executor
        .submit_response(
            &context.execution_id,
            "review",
            HumanResponse::approve().responded_by("alice"),
        )
        .unwrap();
    let output = waiter.await.unwrap().unwrap();
    assert_eq!(output["approved"], json!(true));
    assert_eq!(output["data"], json!({"amount": 120}));
    assert!(output.get("approvedAt").is_some());
    assert!(!executor.has_pending(&context.execution_id, "review"));
}

#[tokio::test]
async fn test_modify_replaces_data() {
    let executor = executor(5_000);
    let context = ctx();
    let waiter = {
        let executor = Arc::clone(&executor);
        let context = context.clone();
        tokio::spawn(async move {
            executor
                .execute(&Step::human("review"), json!({"amount": 120}), &context)
                .await
        })
    };

    let request = wait_for_review(&executor).await;
    assert_eq!(request.timeout_ms, Some(5_000));
    executor
        .submit_response(
            &request.execution_id,
            &request.step_name,
            HumanResponse::modify(json!({"amount": 80})),
        )
        .unwrap();
    let output = waiter.await.unwrap().unwrap();
    assert_eq!(output["modified"], json!(true));
    assert_eq!(output["data"], json!({"amount": 80}));
}

#[tokio::test]
async fn test_reject_fails_with_reason() {
    let executor = executor(0);
    let context = ctx();
    let waiter = {
        let executor = Arc::clone(&executor);
        let context = context.clone();
        tokio::spawn(async move { executor.execute(&Step::human("review"), json!({}), &context).await })
    };

    let request = wait_for_review(&executor).await;
    executor
        .submit_response(&request.execution_id, "review", HumanResponse::reject(None))
        .unwrap();
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.code, "WFG-HIL-001");
    assert_eq!(err.category, ErrorCategory::HumanRejection);
    assert_eq!(err.message, "Human rejected: No reason provided");
}

#[tokio::test]
async fn test_step_timeout_overrides_default() {
    let executor = executor(60_000);
    let step = Step::human("review").with_timeout_ms(20);
    let err = executor.execute(&step, json!({}), &ctx()).await.unwrap_err();
    assert_eq!(err.code, "WFG-HIL-002");
    assert_eq!(err.category, ErrorCategory::TimeoutError);
}

#[tokio::test]
async fn test_duplicate_request_is_rejected() {
    let executor = executor(0);
    let context = ctx();
    let first = {
        let executor = Arc::clone(&executor);
        let context = context.clone();
        tokio::spawn(async move { executor.execute(&Step::human("review"), json!({}), &context).await })
    };
    wait_for_review(&executor).await;

    let err = executor
        .execute(&Step::human("review"), json!({}), &context)
        .await
        .unwrap_err();
    assert_eq!(err.code, "WFG-HIL-003");
    assert!(executor.has_pending(&context.execution_id, "review"));

    executor
        .submit_response(&context.execution_id, "review", HumanResponse::approve())
        .unwrap();
    assert!(first.await.unwrap().is_ok());
}

#[test]
fn test_response_without_pending_request_is_rejected() {
    let executor = executor(0);
    let err = executor
        .submit_response("exec-missing", "review", HumanResponse::approve())
        .unwrap_err();
    assert_eq!(err.code, "WFG-HIL-404");
}

#[test]
fn test_response_decodes_from_reviewer_payload() {
    let response: HumanResponse = serde_json::from_value(json!({
        "action": "reject",
        "reason": "duplicate",
        "respondedBy": "bob"
    }))
    .unwrap();
    assert_eq!(response.action, HumanAction::Reject);
    assert_eq!(response.reason.as_deref(), Some("duplicate"));
    assert_eq!(response.responded_by.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_engine_emits_review_requested_and_resumes() {
    let sink = Arc::new(ListenerEventSink::new());
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    sink.on(REVIEW_REQUESTED, move |event| {
        if let WorkflowEvent::ReviewRequested(request) = event {
            recorder.lock().unwrap().push(request.step_name.clone());
        }
    });

    let engine = Arc::new(
        WorkflowEngine::builder(EngineConfig::default())
            .with_event_sink(sink as Arc<dyn EventSink>)
            .build(),
    );
    engine
        .load_definition(WorkflowDefinition::new(
            "refund",
            Trigger::manual(),
            vec![
                Step::action("prepare", "set").with_input(json!({"amount": "$trigger.amount"})),
                Step::human("approval")
                    .with_input(json!("$prepare"))
                    .with_output("decision"),
                Step::action("pay", "set").with_input(json!("$decision.data")),
            ],
        ))
        .unwrap();

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute("refund", json!({"amount": 42})).await })
    };

    let request = wait_for_engine_review(&engine).await;
    assert_eq!(request.workflow_name, "refund");
    assert_eq!(request.data, json!({"amount": 42}));
    assert_eq!(*seen.lock().unwrap(), vec!["approval".to_string()]);

    engine
        .submit_human_response(&request.execution_id, "approval", HumanResponse::approve())
        .unwrap();
    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.step("approval").unwrap().status, StepStatus::Completed);
    assert_eq!(result.output["pay"], json!({"amount": 42}));
}

#[tokio::test]
async fn test_engine_review_timeout_marks_run_timed_out() {
    let engine = WorkflowEngine::new(EngineConfig {
        human_review_timeout_ms: 20,
        ..Default::default()
    });
    engine
        .load_definition(WorkflowDefinition::new(
            "gated",
            Trigger::manual(),
            vec![Step::human("gate")],
        ))
        .unwrap();
    let result = engine.execute("gated", json!({})).await.unwrap();
    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(result.step("gate").unwrap().status, StepStatus::Timeout);
    assert_eq!(result.error.unwrap().message, "Human review timed out");
}

#[tokio::test]
async fn test_engine_review_timeout_auto_approves() {
    let engine = WorkflowEngine::new(EngineConfig {
        human_review_timeout_ms: 20,
        ..Default::default()
    });
    engine
        .load_definition(WorkflowDefinition::new(
            "gated",
            Trigger::manual(),
            vec![Step::human("gate")
                .with_input(json!({"id": 7}))
                .with_fallback("auto_approve")],
        ))
        .unwrap();
    let result = engine.execute("gated", json!({})).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output["gate"]["autoApproved"], json!(true));
    assert_eq!(result.output["gate"]["data"], json!({"id": 7}));
}
