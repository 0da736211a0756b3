use conduit::core::config::EngineConfig;
use conduit::core::error::AppError;
use conduit::core::types::ErrorCategory;
use conduit::core::workflow::persistence::RunStatePaths;
use conduit::core::workflow::{
    ExecutionContext, FileRunRepository, InMemoryRunRepository, RunRepository, RunStatus, Step,
    StepRecordStatus, StepType, Trigger, WorkflowDefinition, WorkflowEngine,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn triage() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "triage",
        Trigger::manual(),
        vec![
            Step::action("classify", "set").with_input(json!({"priority": "low"})),
            Step::action("page", "noop").with_condition("$classify.priority == \"urgent\""),
            Step::parallel(
                "notify",
                vec![Step::action("email", "noop"), Step::action("chat", "noop")],
            ),
        ],
    )
}

#[tokio::test]
async fn test_in_memory_repository_records_run_and_steps() {
    let repository = Arc::new(InMemoryRunRepository::new());
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_repository(Arc::clone(&repository) as Arc<dyn RunRepository>)
        .build();
    let definition = triage();
    let fingerprint = definition.fingerprint();
    engine.load_definition(definition).unwrap();

    let result = engine
        .execute("triage", json!({"message": "hi", "conversation": {"id": "conv-7"}}))
        .await
        .unwrap();

    let runs = repository.runs();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.execution_id, result.execution_id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.conversation_id.as_deref(), Some("conv-7"));
    assert_eq!(run.definition_fingerprint.as_deref(), Some(fingerprint.as_str()));
    assert!(run.completed_at.is_some());
    assert_eq!(run.result.as_ref().unwrap()["status"], json!("completed"));

    let steps = repository.load_steps(&result.execution_id).await.unwrap();
    let summary: Vec<(&str, StepRecordStatus)> = steps
        .iter()
        .map(|record| (record.step_name.as_str(), record.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("classify", StepRecordStatus::Success),
            ("page", StepRecordStatus::Skipped),
            ("email", StepRecordStatus::Success),
            ("chat", StepRecordStatus::Success),
            ("notify", StepRecordStatus::Success),
        ]
    );
    let page = &steps[1];
    assert_eq!(page.duration_ms, 0);
    assert!(page.output.is_none());
    assert_eq!(steps[4].step_type, StepType::Parallel);
}

#[tokio::test]
async fn test_failed_run_keeps_error_message() {
    let repository = Arc::new(InMemoryRunRepository::new());
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_repository(Arc::clone(&repository) as Arc<dyn RunRepository>)
        .build();
    engine.register_action("explode", |_input: Value, _ctx: ExecutionContext| async {
        Err::<Value, _>(AppError::new(ErrorCategory::ActionError, "kaboom"))
    });
    engine
        .load_definition(WorkflowDefinition::new(
            "boom",
            Trigger::manual(),
            vec![Step::action("explode", "explode")],
        ))
        .unwrap();

    let result = engine.execute("boom", json!({})).await.unwrap();
    let run = repository.load_run(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("kaboom"));

    let steps = repository.load_steps(&result.execution_id).await.unwrap();
    assert_eq!(steps[0].status, StepRecordStatus::Error);
    assert_eq!(steps[0].error_message.as_deref(), Some("kaboom"));
}

#[tokio::test]
async fn test_file_repository_writes_run_and_step_files() {
    let temp = TempDir::new().unwrap();
    let engine = WorkflowEngine::new(EngineConfig {
        state_dir: Some(temp.path().to_path_buf()),
        ..Default::default()
    });
    engine.load_definition(triage()).unwrap();
    let result = engine.execute("triage", json!({})).await.unwrap();

    let paths = RunStatePaths::new(temp.path(), &result.execution_id);
    assert!(paths.run_file.is_file());
    assert!(paths.steps_file.is_file());
    assert!(!paths.run_file.with_extension("tmp").exists());

    let repository = FileRunRepository::new(temp.path());
    assert_eq!(repository.list_runs().unwrap(), vec![result.execution_id.clone()]);

    let run = repository.load_run(&result.execution_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.workflow_name, "triage");

    let steps = repository.load_steps(&result.execution_id).await.unwrap();
    assert_eq!(steps.len(), 5);
    assert_eq!(steps[0].input, Some(json!({"priority": "low"})));
}

#[tokio::test]
async fn test_file_repository_handles_unknown_runs() {
    let temp = TempDir::new().unwrap();
    let repository = FileRunRepository::new(temp.path());
    assert!(repository.list_runs().unwrap().is_empty());
    assert!(repository.load_run("exec-none").await.unwrap().is_none());
    assert!(repository.load_steps("exec-none").await.unwrap().is_empty());
}
