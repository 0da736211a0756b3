use conduit::core::error::AppError;
use conduit::core::types::ErrorCategory;
use conduit::core::workflow::{ActionExecutor, ExecutionContext, Step, StepExecutor};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn ctx() -> ExecutionContext {
    ExecutionContext::new("actions", "manual", json!({}))
}

#[tokio::test]
async fn test_builtin_actions() {
    let executor = ActionExecutor::new();

    let noop = executor
        .execute(&Step::action("a", "noop"), Value::Null, &ctx())
        .await
        .unwrap();
    assert_eq!(noop, json!({"status": "ok"}));

    let log = executor
        .execute(&Step::action("b", "log"), json!("hello"), &ctx())
        .await
        .unwrap();
    assert_eq!(log, json!({"logged": true}));

    let set = executor
        .execute(&Step::action("c", "set"), json!({"k": [1, 2]}), &ctx())
        .await
        .unwrap();
    assert_eq!(set, json!({"k": [1, 2]}));

    let wait = executor
        .execute(&Step::action("d", "wait"), json!({"duration": 5}), &ctx())
        .await
        .unwrap();
    assert_eq!(wait["waited"], json!(5));
    assert!(wait["completedAt"].is_string());
}

#[tokio::test]
async fn test_registered_handler_receives_input_and_context() {
    let executor = ActionExecutor::new();
    executor.register_action("classify", |input: Value, ctx: ExecutionContext| async move {
        let text = input["text"].as_str().unwrap_or_default().to_string();
        let priority = if text.contains("outage") { "urgent" } else { "low" };
        Ok::<_, AppError>(json!({"priority": priority, "workflow": ctx.workflow_name}))
    });

    let output = executor
        .execute(
            &Step::action("classify", "classify"),
            json!({"text": "total outage"}),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(output, json!({"priority": "urgent", "workflow": "actions"}));
}

#[tokio::test]
async fn test_registered_handler_shadows_builtin() {
    let executor = ActionExecutor::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    executor.register_action("noop", move |_input: Value, _ctx: ExecutionContext| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(json!("custom"))
        }
    });

    let output = executor
        .execute(&Step::action("a", "noop"), Value::Null, &ctx())
        .await
        .unwrap();
    assert_eq!(output, json!("custom"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_errors_propagate_unchanged() {
    let executor = ActionExecutor::new();
    executor.register_action("send", |_input: Value, _ctx: ExecutionContext| async {
        Err::<Value, _>(
            AppError::new(ErrorCategory::ActionError, "smtp unavailable").with_code("SMTP-503"),
        )
    });
    let err = executor
        .execute(&Step::action("send", "send"), Value::Null, &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code, "SMTP-503");
    assert_eq!(err.message, "smtp unavailable");
}

#[tokio::test]
async fn test_unknown_and_missing_actions() {
    let executor = ActionExecutor::new();
    let unknown = executor
        .execute(&Step::action("x", "teleport"), Value::Null, &ctx())
        .await
        .unwrap_err();
    assert_eq!(unknown.code, "WFG-ACT-002");
    assert_eq!(unknown.message, "Unknown action: teleport");

    let bare = Step {
        name: "bare".to_string(),
        ..Default::default()
    };
    let missing = executor.execute(&bare, Value::Null, &ctx()).await.unwrap_err();
    assert_eq!(missing.code, "WFG-ACT-001");
}

#[test]
fn test_supports_only_action_steps() {
    let executor = ActionExecutor::new();
    assert!(executor.supports(&Step::action("a", "noop")));
    assert!(!executor.supports(&Step::human("h")));
    assert!(!executor.supports(&Step::parallel("p", vec![Step::action("a", "noop")])));
}
