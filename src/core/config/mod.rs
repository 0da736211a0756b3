pub mod loader;
pub mod validation;

pub use loader::ConfigLoader;
pub use validation::ConfigValidator;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from conduit.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConduitConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Runtime knobs for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline applied to steps without their own timeout. Zero disables it.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Batch size for parallel groups
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// How long a human checkpoint waits when the step declares no timeout.
    #[serde(default = "default_human_review_timeout_ms")]
    pub human_review_timeout_ms: u64,

    /// Emit per-run metrics on the `conduit::metrics` target
    #[serde(default)]
    pub enable_metrics: bool,

    /// Root for the file-backed run repository
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_parallel_steps() -> usize {
    10
}

fn default_human_review_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_timeout_ms: default_timeout_ms(),
            max_parallel_steps: default_max_parallel_steps(),
            human_review_timeout_ms: default_human_review_timeout_ms(),
            enable_metrics: false,
            state_dir: None,
        }
    }
}

impl EngineConfig {
    /// Deadline for a step, `None` meaning unbounded.
    pub fn step_deadline(&self, step_timeout_ms: Option<u64>) -> Option<Duration> {
        match step_timeout_ms.unwrap_or(self.default_timeout_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
