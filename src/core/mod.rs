pub mod config;
pub mod error;
pub mod types;
pub mod workflow;

pub use config::{ConduitConfig, ConfigLoader, ConfigValidator, EngineConfig};
pub use error::AppError;
pub use types::*;
pub use workflow::{WorkflowDefinition, WorkflowEngine};
