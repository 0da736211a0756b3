use conduit::core::config::EngineConfig;
use conduit::core::error::AppError;
use conduit::core::workflow::{
    ExecutionContext, HumanResponse, HumanReviewRequest, InMemoryRunRepository, RunRepository,
    RunStatus, StepRecordStatus, StepStatus, WorkflowDefinition, WorkflowEngine,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICKET_TRIAGE: &str = r#"
name: ticket-triage
trigger:
  type: im_message
  channel: support
steps:
  - name: classify
    action: classify
    input:
      text: $message
  - name: notify
    action: notify
    input:
      priority: $classify.priority
  - name: escalate
    type: human_in_loop
    condition: $classify.priority == "urgent"
    content: Escalate urgent ticket?
    input:
      ticket: $message
      priority: $classify.priority
onError:
  - name: record-failure
    action: set
    input:
      failed: true
onComplete:
  - name: close
    action: noop
"#;

struct Harness {
    engine: Arc<WorkflowEngine>,
    repository: Arc<InMemoryRunRepository>,
    notified: Arc<AtomicUsize>,
}

fn harness(priority: &'static str) -> Harness {
    let repository = Arc::new(InMemoryRunRepository::new());
    let engine = WorkflowEngine::builder(EngineConfig {
        human_review_timeout_ms: 0,
        ..Default::default()
    })
    .with_repository(Arc::clone(&repository) as Arc<dyn RunRepository>)
    .build();

    engine.register_action("classify", move |_input: Value, _ctx: ExecutionContext| async move {
        Ok::<_, AppError>(json!({"priority": priority}))
    });
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    engine.register_action("notify", move |input: Value, _ctx: ExecutionContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(json!({"sent": true, "priority": input["priority"]}))
        }
    });

    let definition: WorkflowDefinition = serde_yaml::from_str(TICKET_TRIAGE).unwrap();
    engine.load_definition(definition).unwrap();
    Harness {
        engine: Arc::new(engine),
        repository,
        notified,
    }
}

async fn wait_for_review(engine: &WorkflowEngine) -> HumanReviewRequest {
    for _ in 0..200 {
        if let Some(request) = engine.pending_human_reviews().into_iter().next() {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("escalation never requested review");
}

#[tokio::test]
async fn test_urgent_ticket_rejected_by_reviewer() {
    let Harness {
        engine,
        repository,
        notified,
    } = harness("urgent");

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute("ticket-triage", json!({"message": "production database is down"}))
                .await
        })
    };

    let request = wait_for_review(&engine).await;
    assert_eq!(request.step_name, "escalate");
    assert_eq!(request.content.as_deref(), Some("Escalate urgent ticket?"));
    assert_eq!(
        request.data,
        json!({"ticket": "production database is down", "priority": "urgent"})
    );
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    engine
        .submit_human_response(
            &request.execution_id,
            "escalate",
            HumanResponse::reject(Some("false alarm")).responded_by("oncall"),
        )
        .unwrap();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.step, "escalate");
    assert_eq!(error.message, "Human rejected: false alarm");
    assert_eq!(result.step("escalate").unwrap().status, StepStatus::Failed);
    assert_eq!(result.output["record-failure"], json!({"failed": true}));
    assert!(result.step("close").is_none());
    assert!(engine.pending_human_reviews().is_empty());

    let record = repository.load_run(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("Human rejected: false alarm"));
}

#[tokio::test]
async fn test_low_priority_ticket_skips_escalation() {
    let Harness {
        engine,
        repository,
        notified,
    } = harness("low");

    let result = engine
        .execute("ticket-triage", json!({"message": "typo on pricing page"}))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(result.output["notify"], json!({"sent": true, "priority": "low"}));
    assert_eq!(result.step("escalate").unwrap().status, StepStatus::Skipped);
    assert_eq!(result.step("close").unwrap().status, StepStatus::Completed);

    let steps = repository.load_steps(&result.execution_id).await.unwrap();
    let escalate = steps.iter().find(|s| s.step_name == "escalate").unwrap();
    assert_eq!(escalate.status, StepRecordStatus::Skipped);
    assert_eq!(
        escalate.input,
        Some(json!({"ticket": "typo on pricing page", "priority": "low"}))
    );
}

#[tokio::test]
async fn test_urgent_ticket_approved_completes() {
    let Harness { engine, .. } = harness("urgent");
    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute("ticket-triage", json!({"message": "checkout failing"}))
                .await
        })
    };

    let request = wait_for_review(&engine).await;
    engine
        .submit_human_response(&request.execution_id, "escalate", HumanResponse::approve())
        .unwrap();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output["escalate"]["approved"], json!(true));
    assert_eq!(result.step("close").unwrap().status, StepStatus::Completed);
}
