//! Workflow definitions, validation, and the registry

mod error;
mod loader;
mod workflow;

pub use error::ConfigError;
pub use loader::{WorkflowRegistry, builtin_workflows, load_registry};
pub use workflow::{
    DEFAULT_STEP_TIMEOUT_SECS, ParamMap, QualityThresholds, StepConfig, WorkflowConfig,
    WorkflowSettings,
};
