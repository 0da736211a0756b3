use crate::core::types::{ErrorCategory, ErrorSeverity};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Error carried through the engine, executors and repositories.
///
/// `code` is the stable identifier hosts match on (`WFG-HIL-001`, `WFG-TIME-001`, ...);
/// errors built without one get a unique `ERR-<uuid>` code.
#[derive(Debug)]
pub struct AppError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub code: String,
    pub message: String,
    pub context: HashMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    pub stack_trace: Option<String>,
    pub source: Option<anyhow::Error>,
}

impl AppError {
    pub fn new<T: Into<String>>(category: ErrorCategory, message: T) -> Self {
        let severity = match category {
            ErrorCategory::DefinitionError
            | ErrorCategory::ValidationError
            | ErrorCategory::ActionError
            | ErrorCategory::TimeoutError
            | ErrorCategory::SerializationError
            | ErrorCategory::IoError
            | ErrorCategory::InternalError => ErrorSeverity::Error,
            ErrorCategory::HumanRejection => ErrorSeverity::Warning,
            ErrorCategory::Unknown => ErrorSeverity::Info,
        };
        AppError {
            category,
            severity,
            code: format!("ERR-{}", uuid::Uuid::new_v4().simple()),
            message: message.into(),
            context: HashMap::new(),
            occurred_at: Utc::now(),
            stack_trace: None,
            source: None,
        }
    }

    pub fn with_source<T: Into<String>>(
        category: ErrorCategory,
        message: T,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = AppError::new(category, message);
        error.source = Some(anyhow::anyhow!(source));
        error
    }

    /// Wrap a foreign error, keeping it as the source of the trace.
    fn wrap(category: ErrorCategory, code: &str, source: anyhow::Error) -> Self {
        let mut error = AppError::new(category, source.to_string()).with_code(code);
        error.source = Some(source);
        error
    }

    pub fn with_context<T: Into<String>>(mut self, context: T) -> Self {
        self.context.insert("context".to_string(), context.into());
        self
    }

    pub fn with_code<T: Into<String>>(mut self, code: T) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_stack_trace<T: Into<String>>(mut self, trace: T) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn add_context(&mut self, key: &str, value: &str) {
        self.context.insert(key.to_string(), value.to_string());
    }

    /// Rendered trace stored on failed runs: code, category and the source chain.
    pub fn trace(&self) -> String {
        if let Some(trace) = &self.stack_trace {
            return trace.clone();
        }
        let mut lines = vec![format!("[{}] {}: {}", self.code, self.category, self.message)];
        if let Some(source) = &self.source {
            for cause in source.chain() {
                lines.push(format!("  caused by: {}", cause));
            }
        }
        lines.join("\n")
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.category, self.message)?;
        if !self.context.is_empty() {
            write!(f, " (Context: {:?})", self.context)?;
        }
        if let Some(ref source) = self.source {
            write!(f, "\nCaused by: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::wrap(ErrorCategory::InternalError, "WFG-INTERNAL-000", e)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::wrap(ErrorCategory::IoError, "WFG-IO-000", e.into())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::wrap(ErrorCategory::SerializationError, "WFG-SERDE-000", e.into())
    }
}
