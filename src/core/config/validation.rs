#![allow(clippy::result_large_err)]

use super::ConduitConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration rules
    pub fn validate(config: &ConduitConfig) -> Result<(), AppError> {
        if config.engine.max_parallel_steps == 0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "engine.max_parallel_steps must be at least 1",
            )
            .with_code("CFG-003"));
        }

        if let Some(dir) = &config.engine.state_dir {
            if dir.as_os_str().is_empty() {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    "engine.state_dir cannot be empty",
                )
                .with_code("CFG-003"));
            }
        }

        Ok(())
    }
}
