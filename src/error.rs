//! Run-level errors

use crate::core::{ConfigError, UnresolvedVariable};
use crate::engine::EngineError;
use crate::execution::container::ContainerError;
use crate::execution::resources::ResourceKind;
use thiserror::Error;

/// The first failure of a run, with the stage and entity it belongs to
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline definition: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Environment(#[from] UnresolvedVariable),

    #[error("cannot forward the SSH agent to build step <{0}> because SSH_AUTH_SOCK is not set")]
    SshAgentUnavailable(String),

    #[error("failed to {action} {kind} <{name}>: {source}")]
    Resource {
        action: &'static str,
        kind: ResourceKind,
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to {action} repository <{name}>: {source}")]
    Repository {
        name: String,
        action: &'static str,
        #[source]
        source: ContainerError,
    },

    #[error("failed to start service <{name}>: {source}")]
    ServiceStart {
        name: String,
        #[source]
        source: ContainerError,
    },

    #[error("failed to stop service <{name}> with ID <{container_id}>: {source}")]
    ServiceStop {
        name: String,
        container_id: String,
        #[source]
        source: ContainerError,
    },

    #[error("failed to inject files: {0}")]
    Inject(#[source] ContainerError),

    #[error("failed to extract files: {0}")]
    Extract(#[source] ContainerError),

    #[error("failed to run build step <{name}>: {source}")]
    Step {
        name: String,
        #[source]
        source: ContainerError,
    },
}

impl PipelineError {
    /// Exit code of the build step that failed, if the failure was one
    pub fn step_exit_status(&self) -> Option<i64> {
        match self {
            PipelineError::Step { source, .. } => source.exit_status(),
            _ => None,
        }
    }
}
