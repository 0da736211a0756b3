#![allow(clippy::result_large_err)] // Repositories return AppError so the engine can log structured diagnostics.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::schema::StepType;
use crate::core::workflow::state::{RunResult, RunStatus, StepResult, StepStatus, TriggerData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Persisted view of one run, upserted when it starts and when it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub execution_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerData>,
    /// SHA-256 of the definition the run executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl RunRecord {
    pub fn running(
        execution_id: impl Into<String>,
        workflow_name: impl Into<String>,
        trigger: TriggerData,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Running,
            conversation_id: conversation_id(&trigger.data),
            trigger: Some(trigger),
            definition_fingerprint: None,
            result: None,
            error_message: None,
            started_at,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.definition_fingerprint = Some(fingerprint.into());
        self
    }

    /// Fold the terminal result into the record.
    pub fn finish(&mut self, result: &RunResult) -> Result<(), AppError> {
        self.status = result.status;
        self.error_message = result.error.as_ref().map(|err| err.message.clone());
        self.completed_at = Some(result.completed_at);
        self.duration_ms = Some(result.duration_ms);
        self.result = Some(serde_json::to_value(result).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize run result: {}", err),
            )
            .with_code("WFG-PERSIST-003")
        })?);
        Ok(())
    }
}

/// `conversation.id` or `conversationId` from the trigger payload.
fn conversation_id(payload: &Value) -> Option<String> {
    payload
        .pointer("/conversation/id")
        .or_else(|| payload.get("conversationId"))
        .and_then(|id| match id {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRecordStatus {
    Success,
    Error,
    Skipped,
}

impl From<StepStatus> for StepRecordStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Completed => StepRecordStatus::Success,
            StepStatus::Skipped => StepRecordStatus::Skipped,
            StepStatus::Failed | StepStatus::Timeout => StepRecordStatus::Error,
        }
    }
}

/// Persisted view of one step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub execution_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepRecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn from_result(execution_id: &str, step_type: StepType, result: &StepResult) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            step_name: result.step_name.clone(),
            step_type,
            status: result.status.into(),
            input: result.input.clone(),
            output: result.output.clone(),
            error_message: result.error.clone(),
            started_at: result.started_at,
            completed_at: result.completed_at,
            duration_ms: result.duration_ms,
        }
    }
}

/// Storage for run history. The engine treats every failure as non-fatal.
#[async_trait]
pub trait RunRepository: Send + Sync + 'static {
    /// Insert the record or replace the one with the same execution id.
    async fn create_or_update(&self, record: &RunRecord) -> Result<(), AppError>;

    async fn save_step(&self, record: &StepRecord) -> Result<(), AppError>;

    async fn load_run(&self, execution_id: &str) -> Result<Option<RunRecord>, AppError>;

    /// Step records of one run in the order they were saved.
    async fn load_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, AppError>;
}

/// Process-local repository, mostly for hosts without durable storage and tests.
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<IndexMap<String, RunRecord>>,
    steps: RwLock<Vec<StepRecord>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        let guard = self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.values().cloned().collect()
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        let guard = self.steps.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_or_update(&self, record: &RunRecord) -> Result<(), AppError> {
        let mut guard = self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(record.execution_id.clone(), record.clone());
        Ok(())
    }

    async fn save_step(&self, record: &StepRecord) -> Result<(), AppError> {
        let mut guard = self.steps.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(record.clone());
        Ok(())
    }

    async fn load_run(&self, execution_id: &str) -> Result<Option<RunRecord>, AppError> {
        let guard = self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(execution_id).cloned())
    }

    async fn load_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, AppError> {
        let guard = self.steps.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard
            .iter()
            .filter(|record| record.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

/// Paths under `.conduit/state/workflows/<execution_id>`.
pub struct RunStatePaths {
    pub run_dir: PathBuf,
    pub run_file: PathBuf,
    pub steps_file: PathBuf,
}

impl RunStatePaths {
    pub fn new(root: &Path, execution_id: &str) -> Self {
        let run_dir = Self::workflows_dir(root).join(execution_id);
        let run_file = run_dir.join("run.json");
        let steps_file = run_dir.join("steps.jsonl");
        Self {
            run_dir,
            run_file,
            steps_file,
        }
    }

    pub fn workflows_dir(root: &Path) -> PathBuf {
        root.join(".conduit/state/workflows")
    }
}

/// JSON files on disk: `run.json` rewritten atomically, `steps.jsonl` appended.
pub struct FileRunRepository {
    root: PathBuf,
}

impl FileRunRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn paths(&self, execution_id: &str) -> RunStatePaths {
        RunStatePaths::new(&self.root, execution_id)
    }

    /// Execution ids with a stored run, sorted.
    pub fn list_runs(&self) -> Result<Vec<String>, AppError> {
        let base = RunStatePaths::workflows_dir(&self.root);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&base).map_err(|err| {
            io_error(format!("failed to read {}: {}", base.display(), err))
        })?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            if entry.path().join("run.json").is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn io_error(message: String) -> AppError {
    AppError::new(ErrorCategory::IoError, message).with_code("WFG-PERSIST-001")
}

fn serialization_error(message: String) -> AppError {
    AppError::new(ErrorCategory::SerializationError, message).with_code("WFG-PERSIST-002")
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            io_error(format!(
                "failed to create directory {}: {}",
                parent.display(),
                err
            ))
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)
        .map_err(|err| io_error(format!("failed to write {}: {}", tmp_path.display(), err)))?;
    fs::rename(&tmp_path, path).map_err(|err| {
        io_error(format!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            err
        ))
    })
}

#[async_trait]
impl RunRepository for FileRunRepository {
    async fn create_or_update(&self, record: &RunRecord) -> Result<(), AppError> {
        let paths = self.paths(&record.execution_id);
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| serialization_error(format!("failed to serialize run.json: {}", err)))?;
        atomic_write(&paths.run_file, &content)
    }

    async fn save_step(&self, record: &StepRecord) -> Result<(), AppError> {
        let paths = self.paths(&record.execution_id);
        fs::create_dir_all(&paths.run_dir).map_err(|err| {
            io_error(format!(
                "failed to create directory {}: {}",
                paths.run_dir.display(),
                err
            ))
        })?;
        let mut line = serde_json::to_vec(record).map_err(|err| {
            serialization_error(format!("failed to serialize step record: {}", err))
        })?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.steps_file)
            .map_err(|err| {
                io_error(format!("failed to open {}: {}", paths.steps_file.display(), err))
            })?;
        file.write_all(&line).map_err(|err| {
            io_error(format!("failed to append {}: {}", paths.steps_file.display(), err))
        })
    }

    async fn load_run(&self, execution_id: &str) -> Result<Option<RunRecord>, AppError> {
        let paths = self.paths(execution_id);
        if !paths.run_file.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&paths.run_file).map_err(|err| {
            io_error(format!("failed to read {}: {}", paths.run_file.display(), err))
        })?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| serialization_error(format!("failed to deserialize run.json: {}", err)))
    }

    async fn load_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, AppError> {
        let paths = self.paths(execution_id);
        if !paths.steps_file.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&paths.steps_file).map_err(|err| {
            io_error(format!("failed to open {}: {}", paths.steps_file.display(), err))
        })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| {
                io_error(format!("failed to read {}: {}", paths.steps_file.display(), err))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line).map_err(|err| {
                serialization_error(format!("failed to deserialize step record: {}", err))
            })?);
        }
        Ok(records)
    }
}
