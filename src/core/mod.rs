//! Core domain models
//!
//! This module defines the pipeline definition loaded from YAML, the
//! environment resolution rules, and the state of a run.

pub mod config;
pub mod environment;
pub mod state;

pub use config::{ConfigError, FileTransfer, PipelineDefinition, Repository, Service, Settings, Step};
pub use environment::{Scope, UnresolvedVariable};
pub use state::*;
