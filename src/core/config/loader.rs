#![allow(clippy::result_large_err)]

use super::{ConduitConfig, ConfigValidator};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from workspace root (workspace/conduit.toml)
    /// Environment variables override config file values
    pub fn load_from_workspace(workspace_path: &Path) -> Result<ConduitConfig, AppError> {
        let config_path = workspace_path.join("conduit.toml");
        let config_file = Self::load_from_file(&config_path)?;

        let mut config = config_file.unwrap_or_default();

        Self::apply_env_overrides(&mut config);
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Load config from specific file path
    /// Returns Ok(None) if file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<ConduitConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
            .with_code("CFG-001")
        })?;

        let config: ConduitConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("CFG-002")
        })?;

        Ok(Some(config))
    }

    /// Environment variables take precedence over config file values
    fn apply_env_overrides(config: &mut ConduitConfig) {
        if let Some(ms) = env_millis("CONDUIT_DEFAULT_TIMEOUT") {
            config.engine.default_timeout_ms = ms;
        }

        if let Ok(raw) = env::var("CONDUIT_MAX_PARALLEL_STEPS") {
            match raw.trim().parse::<usize>() {
                Ok(max) => config.engine.max_parallel_steps = max,
                Err(_) => warn_unparsable("CONDUIT_MAX_PARALLEL_STEPS", &raw),
            }
        }

        if let Some(ms) = env_millis("CONDUIT_HUMAN_REVIEW_TIMEOUT") {
            config.engine.human_review_timeout_ms = ms;
        }

        if let Ok(raw) = env::var("CONDUIT_ENABLE_METRICS") {
            match raw.trim().parse::<bool>() {
                Ok(enabled) => config.engine.enable_metrics = enabled,
                Err(_) => warn_unparsable("CONDUIT_ENABLE_METRICS", &raw),
            }
        }

        if let Ok(dir) = env::var("CONDUIT_STATE_DIR") {
            if !dir.trim().is_empty() {
                config.engine.state_dir = Some(PathBuf::from(dir));
            }
        }
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "CONDUIT_DEFAULT_TIMEOUT - Default step deadline, e.g. 30s or 30000 (0 disables)",
            "CONDUIT_MAX_PARALLEL_STEPS - Batch size for parallel groups (default: 10)",
            "CONDUIT_HUMAN_REVIEW_TIMEOUT - Human checkpoint wait, e.g. 5m (default: 300000)",
            "CONDUIT_ENABLE_METRICS - Emit run metrics (true/false)",
            "CONDUIT_STATE_DIR - Root directory for file-backed run history",
        ]
    }
}

/// Accepts bare milliseconds or a humantime duration such as `1m 30s`.
fn env_millis(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    let parsed = parse_millis(&raw);
    if parsed.is_none() {
        warn_unparsable(name, &raw);
    }
    parsed
}

fn warn_unparsable(name: &str, raw: &str) {
    tracing::warn!(var = name, value = %raw, "ignoring unparsable environment override");
}

pub(crate) fn parse_millis(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Some(ms);
    }
    humantime::parse_duration(trimmed)
        .ok()
        .map(|d: Duration| d.as_millis() as u64)
}
