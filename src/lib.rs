//! insulate - runs declarative build pipelines inside ephemeral containers

pub mod cli;
pub mod core;
pub mod engine;
pub mod error;
pub mod execution;

// Re-export commonly used types
pub use crate::core::{ExecutionStatus, PipelineDefinition, RunStage, RunState, Settings};
pub use crate::engine::{ContainerEngine, DockerEngine, EngineError};
pub use crate::error::PipelineError;
pub use crate::execution::{Orchestrator, PipelineEvent};

/// Run `definition` to completion against `engine`
pub async fn run<E: ContainerEngine>(definition: PipelineDefinition, engine: E) -> Result<(), PipelineError> {
    Orchestrator::new(engine, definition).run().await
}
