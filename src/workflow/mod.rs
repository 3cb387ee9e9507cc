//! 工作流：plan → delegate → verify → record 固定流水线

pub mod builder;
pub mod orchestrator;
pub mod types;

pub use builder::{WorkflowBuilder, WorkflowRequest};
pub use orchestrator::{OrchestratorOptions, WorkflowOrchestrator, WORKFLOW_HOOK_PRIORITY};
pub use types::*;
