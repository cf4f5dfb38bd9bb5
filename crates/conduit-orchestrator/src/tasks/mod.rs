//! Multi-step task definitions, handlers, and the orchestrator that runs them.

pub mod definition;
pub mod handlers;
pub mod orchestrator;
pub mod status;

pub use definition::{DefinitionError, StepParameters, StepType, TaskDefinition, TaskStep};
pub use handlers::{
    LlmQueryHandler, StepContext, StepHandler, StepOutput, ValidationHandler, render_prompt,
};
pub use orchestrator::{StepCallback, TaskOrchestrator};
pub use status::{StepResult, StepStatus, TaskExecutionResult, TaskStatus};
