//! Pipeline execution: container lifecycles, file transfer and run orchestration

pub mod archive;
pub mod container;
pub mod events;
pub mod orchestrator;
pub mod paths;
pub mod repos;
pub mod resources;
pub mod transfer;

pub use container::{ContainerDescriptor, ContainerError, ContainerRunner, Stage};
pub use events::{EventBus, EventHandler, PipelineEvent};
pub use orchestrator::{Orchestrator, StartedService, DOCKER_SOCKET};
pub use resources::{ResourceKind, ResourceManager};
pub use transfer::{FileTransferUnit, TransferError};
