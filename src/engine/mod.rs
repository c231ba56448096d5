//! Container engine abstraction
//!
//! Everything a pipeline needs from a container runtime goes through
//! [`ContainerEngine`]. [`docker::DockerEngine`] is the production backend.

pub mod docker;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use docker::DockerEngine;
pub use stream::{demultiplex, encode_frame, BufferSink, Frame, FrameDecoder, NullSink, OutputSink, StdoutSink, StreamKind};

/// Raw bytes coming out of the engine
pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Status lines reported while an image is pulled
pub type ProgressStream = BoxStream<'static, Result<String, EngineError>>;

/// Writer connected to a container's standard input
pub type InputStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Errors reported by a container engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine API error: {0}")]
    Api(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Volume,
    Bind,
}

/// A volume or host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
}

impl Mount {
    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
        }
    }

    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Fixed container name; the engine picks one when absent
    pub name: Option<String>,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Network to attach to, if any
    pub network: Option<String>,
    pub privileged: bool,
    /// Keep standard input open for a single attached writer
    pub open_stdin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Metadata of a path inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub kind: PathKind,
    /// Target of a symbolic link, empty otherwise
    pub link_target: String,
}

impl PathStat {
    pub fn is_dir(&self) -> bool {
        self.kind == PathKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == PathKind::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.kind == PathKind::File
    }
}

/// Operations a container runtime has to provide
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Start pulling an image; the pull is complete once the stream ends
    async fn pull_image(&self, image: &str) -> Result<ProgressStream, EngineError>;

    /// Create a container and return its ID
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Attach to the container's standard input
    async fn attach_stdin(&self, id: &str) -> Result<InputStream, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Wait until the container is no longer running and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Stdout and stderr in the multiplexed frame format
    async fn container_logs(&self, id: &str, follow: bool) -> Result<ByteStream, EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Stat a path inside the container without following a final symlink
    async fn stat_path(&self, id: &str, path: &str) -> Result<PathStat, EngineError>;

    /// Extract a tar archive into `dir` inside the container
    async fn copy_to_container(&self, id: &str, dir: &str, archive: Vec<u8>) -> Result<(), EngineError>;

    /// Read `path` out of the container as a tar archive
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<(ByteStream, PathStat), EngineError>;

    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), EngineError>;

    async fn list_volumes(&self) -> Result<Vec<String>, EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Create a network and return its ID
    async fn create_network(&self, name: &str, driver: &str) -> Result<String, EngineError>;

    async fn list_networks(&self) -> Result<Vec<String>, EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_constructors() {
        assert_eq!(
            Mount::volume("myvolume", "/src"),
            Mount {
                kind: MountKind::Volume,
                source: "myvolume".to_string(),
                target: "/src".to_string()
            }
        );
        assert_eq!(Mount::bind("/var/run/docker.sock", "/var/run/docker.sock").kind, MountKind::Bind);
    }

    #[test]
    fn test_path_stat_kind_helpers() {
        let stat = PathStat {
            name: "src".to_string(),
            size: 0,
            mode: 0o755,
            kind: PathKind::Directory,
            link_target: String::new(),
        };
        assert!(stat.is_dir());
        assert!(!stat.is_symlink());
        assert!(!stat.is_regular());
    }
}
