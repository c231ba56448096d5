//! Container lifecycle manager
//!
//! Drives one container through pull, create, file injection, attach, start,
//! command delivery, output capture, bounded wait, file extraction and
//! removal. Once a container has been created it is always removed, whatever
//! happens in between.

use crate::core::config::FileTransfer;
use crate::engine::{demultiplex, ContainerEngine, ContainerSpec, EngineError, Mount, NullSink, OutputSink};
use crate::execution::events::{EventBus, PipelineEvent};
use crate::execution::transfer::{FileTransferUnit, TransferError};
use futures_util::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle stage, reported with every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pull,
    Create,
    Inject,
    Attach,
    Start,
    Send,
    Logs,
    Wait,
    Extract,
    Stop,
    Remove,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pull => "pull",
            Stage::Create => "create",
            Stage::Inject => "inject",
            Stage::Attach => "attach",
            Stage::Start => "start",
            Stage::Send => "send",
            Stage::Logs => "logs",
            Stage::Wait => "wait",
            Stage::Extract => "extract",
            Stage::Stop => "stop",
            Stage::Remove => "remove",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("{stage} failed for <{image}>: {source}")]
    Lifecycle {
        stage: Stage,
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("{stage} failed: {source}")]
    Transfer {
        stage: Stage,
        #[source]
        source: TransferError,
    },

    #[error("timed out waiting for container <{0}>")]
    Timeout(String),

    #[error("return code not zero ({0})")]
    ExitStatus(i64),
}

impl ContainerError {
    pub fn stage(&self) -> Stage {
        match self {
            ContainerError::Lifecycle { stage, .. } | ContainerError::Transfer { stage, .. } => *stage,
            ContainerError::Timeout(_) | ContainerError::ExitStatus(_) => Stage::Wait,
        }
    }

    /// Exit code of a container that ran to completion and failed
    pub fn exit_status(&self) -> Option<i64> {
        match self {
            ContainerError::ExitStatus(code) => Some(*code),
            _ => None,
        }
    }
}

/// Run `work` unless `deadline` passes first
async fn before<T>(
    deadline: Instant,
    subject: &str,
    work: impl Future<Output = Result<T, ContainerError>>,
) -> Result<T, ContainerError> {
    match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(ContainerError::Timeout(subject.to_string())),
    }
}

fn failed(stage: Stage, image: &str) -> impl FnOnce(EngineError) -> ContainerError + '_ {
    move |source| ContainerError::Lifecycle {
        stage,
        image: image.to_string(),
        source,
    }
}

/// Everything needed to run one foreground container
#[derive(Clone)]
pub struct ContainerDescriptor {
    pub image: String,
    /// Command (or entrypoint) the container starts with
    pub shell: Vec<String>,
    /// Lines fed to the shell's standard input
    pub commands: Vec<String>,
    pub user: Option<String>,
    pub environment: Vec<String>,
    /// Where the shared volume is mounted
    pub mount_point: String,
    /// Defaults to the mount point
    pub working_dir: Option<String>,
    pub network: Option<String>,
    pub volume: String,
    /// Extra bind mounts
    pub binds: Vec<Mount>,
    /// Start with the shell as entrypoint instead of as command
    pub override_entrypoint: bool,
    pub sink: Arc<dyn OutputSink>,
    /// Injected before start, extracted after a successful exit
    pub files: Vec<FileTransfer>,
}

impl ContainerDescriptor {
    pub fn new(image: impl Into<String>, volume: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            shell: vec!["sh".to_string()],
            commands: Vec::new(),
            user: None,
            environment: Vec::new(),
            mount_point: mount_point.into(),
            working_dir: None,
            network: None,
            volume: volume.into(),
            binds: Vec::new(),
            override_entrypoint: false,
            sink: Arc::new(NullSink),
            files: Vec::new(),
        }
    }

    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_environment(mut self, environment: Vec<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_bind(mut self, bind: Mount) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn with_entrypoint_override(mut self, override_entrypoint: bool) -> Self {
        self.override_entrypoint = override_entrypoint;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_files(mut self, files: Vec<FileTransfer>) -> Self {
        self.files = files;
        self
    }

    /// The engine-level creation request for this descriptor
    pub fn container_spec(&self) -> ContainerSpec {
        let mut mounts = vec![Mount::volume(&self.volume, &self.mount_point)];
        mounts.extend(self.binds.iter().cloned());

        let (cmd, entrypoint) = if self.override_entrypoint {
            (None, Some(self.shell.clone()))
        } else {
            (Some(self.shell.clone()), None)
        };

        ContainerSpec {
            name: None,
            image: self.image.clone(),
            cmd,
            entrypoint,
            user: self.user.clone().filter(|u| !u.is_empty()),
            working_dir: Some(
                self.working_dir
                    .clone()
                    .unwrap_or_else(|| self.mount_point.clone()),
            ),
            env: self.environment.clone(),
            mounts,
            network: self.network.clone(),
            privileged: false,
            open_stdin: true,
        }
    }

    fn injections(&self) -> impl Iterator<Item = &FileTransfer> {
        self.files.iter().filter(|f| f.is_inject())
    }

    fn extractions(&self) -> impl Iterator<Item = &FileTransfer> {
        self.files.iter().filter(|f| !f.is_inject())
    }
}

impl fmt::Debug for ContainerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerDescriptor")
            .field("image", &self.image)
            .field("shell", &self.shell)
            .field("commands", &self.commands)
            .field("user", &self.user)
            .field("environment", &self.environment)
            .field("mount_point", &self.mount_point)
            .field("working_dir", &self.working_dir)
            .field("network", &self.network)
            .field("volume", &self.volume)
            .field("binds", &self.binds)
            .field("override_entrypoint", &self.override_entrypoint)
            .field("files", &self.files)
            .finish()
    }
}

/// Runs containers against an engine
pub struct ContainerRunner<'a, E> {
    engine: &'a E,
    events: Option<&'a EventBus>,
}

impl<'a, E: ContainerEngine> ContainerRunner<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine, events: None }
    }

    /// Report image pulls to the given event bus
    pub fn with_events(mut self, events: &'a EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Pull an image, draining the progress stream until the pull completes
    pub async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        self.emit(PipelineEvent::ImagePullStarted {
            image: image.to_string(),
        });
        let mut progress = self
            .engine
            .pull_image(image)
            .await
            .map_err(failed(Stage::Pull, image))?;
        while let Some(update) = progress.next().await {
            let status = update.map_err(failed(Stage::Pull, image))?;
            debug!("Pulling {}: {}", image, status);
        }
        self.emit(PipelineEvent::ImagePulled {
            image: image.to_string(),
        });
        Ok(())
    }

    /// Run a foreground container to completion. Every stage before removal
    /// is bounded by `deadline`; removal always runs.
    pub async fn execute(&self, descriptor: &ContainerDescriptor, deadline: Instant) -> Result<(), ContainerError> {
        let image = descriptor.image.as_str();
        before(deadline, image, self.pull(image)).await?;

        let spec = descriptor.container_spec();
        let id = before(deadline, image, async {
            self.engine
                .create_container(&spec)
                .await
                .map_err(failed(Stage::Create, image))
        })
        .await?;
        debug!("Created container {} from {}", id, image);

        let outcome = self.drive(&id, descriptor, deadline).await;
        let removal = self
            .engine
            .remove_container(&id, true)
            .await
            .map_err(failed(Stage::Remove, image));

        match (outcome, removal) {
            (Ok(()), removal) => removal,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(removal_err)) => {
                warn!("Failed to remove container {}: {}", id, removal_err);
                Err(err)
            }
        }
    }

    async fn drive(&self, id: &str, descriptor: &ContainerDescriptor, deadline: Instant) -> Result<(), ContainerError> {
        let image = descriptor.image.as_str();
        let transfer = FileTransferUnit::new(self.engine);

        before(deadline, id, async {
            for file in descriptor.injections() {
                transfer
                    .inject(id, file, &descriptor.mount_point)
                    .await
                    .map_err(|source| ContainerError::Transfer {
                        stage: Stage::Inject,
                        source,
                    })?;
            }
            Ok::<_, ContainerError>(())
        })
        .await?;

        let logs = before(deadline, id, async {
            let mut input = self
                .engine
                .attach_stdin(id)
                .await
                .map_err(failed(Stage::Attach, image))?;
            self.engine
                .start_container(id)
                .await
                .map_err(failed(Stage::Start, image))?;

            let script = descriptor.commands.join("\n");
            input
                .write_all(script.as_bytes())
                .await
                .map_err(|err| failed(Stage::Send, image)(err.into()))?;
            input
                .shutdown()
                .await
                .map_err(|err| failed(Stage::Send, image)(err.into()))?;
            drop(input);

            self.engine
                .container_logs(id, true)
                .await
                .map_err(failed(Stage::Logs, image))
        })
        .await?;
        let sink = Arc::clone(&descriptor.sink);
        let mut output = tokio::spawn(async move { demultiplex(logs, sink.as_ref()).await });

        let status = before(deadline, id, async {
            self.engine
                .wait_container(id)
                .await
                .map_err(failed(Stage::Wait, image))
        })
        .await;
        let drained = if status.is_ok() {
            tokio::time::timeout_at(deadline, &mut output).await.ok()
        } else {
            None
        };
        let output_timed_out = drained.is_none();
        match drained {
            Some(Ok(Ok(bytes))) => debug!("Container {} wrote {} bytes of output", id, bytes),
            Some(Ok(Err(err))) => warn!("Output of container {} ended early: {}", id, err),
            Some(Err(err)) => warn!("Output task of container {} failed: {}", id, err),
            None => {
                output.abort();
                let _ = output.await;
            }
        }

        let code = status?;
        if output_timed_out {
            return Err(ContainerError::Timeout(id.to_string()));
        }
        if code != 0 {
            return Err(ContainerError::ExitStatus(code));
        }

        before(deadline, id, async {
            for file in descriptor.extractions() {
                transfer
                    .extract(id, file, &descriptor.mount_point)
                    .await
                    .map_err(|source| ContainerError::Transfer {
                        stage: Stage::Extract,
                        source,
                    })?;
            }
            Ok::<_, ContainerError>(())
        })
        .await
    }

    /// Start a long-running container without attaching to it. Pull, create
    /// and start are bounded by `deadline`.
    pub async fn start_background(&self, spec: &ContainerSpec, deadline: Instant) -> Result<String, ContainerError> {
        let image = spec.image.as_str();
        before(deadline, image, self.pull(image)).await?;

        let id = before(deadline, image, async {
            self.engine
                .create_container(spec)
                .await
                .map_err(failed(Stage::Create, image))
        })
        .await?;

        let started = before(deadline, &id, async {
            self.engine
                .start_container(&id)
                .await
                .map_err(failed(Stage::Start, image))
        })
        .await;
        if let Err(err) = started {
            if let Err(removal) = self.engine.remove_container(&id, true).await {
                warn!("Failed to remove container {} after failed start: {}", id, removal);
            }
            return Err(err);
        }
        debug!("Started background container {} from {}", id, image);
        Ok(id)
    }

    /// Stop a background container, hand its output to `sink` unless it is
    /// `None`, then remove it. Removal is attempted even if stopping fails.
    pub async fn stop_and_remove(&self, id: &str, image: &str, sink: Option<&dyn OutputSink>) -> Result<(), ContainerError> {
        let stopped = self
            .engine
            .stop_container(id)
            .await
            .map_err(failed(Stage::Stop, image));

        if let Some(sink) = sink {
            match self.engine.container_logs(id, false).await {
                Ok(logs) => {
                    if let Err(err) = demultiplex(logs, sink).await {
                        warn!("Failed to read output of container {}: {}", id, err);
                    }
                }
                Err(err) => warn!("Failed to read output of container {}: {}", id, err),
            }
        }

        let removed = self
            .engine
            .remove_container(id, true)
            .await
            .map_err(failed(Stage::Remove, image));

        match (stopped, removed) {
            (Err(stop_err), Err(remove_err)) => {
                warn!("Failed to remove container {}: {}", id, remove_err);
                Err(stop_err)
            }
            (stopped, removed) => stopped.and(removed),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = self.events {
            events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MountKind;

    #[test]
    fn test_container_spec_uses_shell_as_command() {
        let descriptor = ContainerDescriptor::new("rust:1", "myvolume", "/src")
            .with_shell(vec!["bash".to_string(), "-e".to_string()])
            .with_environment(vec!["A=1".to_string()])
            .with_network("mynetwork")
            .with_user(Some(String::new()));
        let spec = descriptor.container_spec();

        assert_eq!(spec.cmd, Some(vec!["bash".to_string(), "-e".to_string()]));
        assert_eq!(spec.entrypoint, None);
        assert_eq!(spec.user, None);
        assert_eq!(spec.working_dir.as_deref(), Some("/src"));
        assert_eq!(spec.network.as_deref(), Some("mynetwork"));
        assert_eq!(spec.env, vec!["A=1".to_string()]);
        assert!(spec.open_stdin);
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].kind, MountKind::Volume);
        assert_eq!(spec.mounts[0].target, "/src");
    }

    #[test]
    fn test_container_spec_entrypoint_override_and_binds() {
        let descriptor = ContainerDescriptor::new("alpine", "myvolume", "/src")
            .with_entrypoint_override(true)
            .with_working_dir("/src/app")
            .with_user(Some("1000".to_string()))
            .with_bind(Mount::bind("/var/run/docker.sock", "/var/run/docker.sock"));
        let spec = descriptor.container_spec();

        assert_eq!(spec.cmd, None);
        assert_eq!(spec.entrypoint, Some(vec!["sh".to_string()]));
        assert_eq!(spec.working_dir.as_deref(), Some("/src/app"));
        assert_eq!(spec.user.as_deref(), Some("1000"));
        assert_eq!(spec.mounts.len(), 2);
        assert_eq!(spec.mounts[1].kind, MountKind::Bind);
    }

    #[test]
    fn test_error_stage_and_exit_status() {
        assert_eq!(ContainerError::ExitStatus(2).stage(), Stage::Wait);
        assert_eq!(ContainerError::ExitStatus(2).exit_status(), Some(2));
        assert_eq!(ContainerError::Timeout("abc".to_string()).exit_status(), None);
        let err = failed(Stage::Attach, "alpine")(EngineError::Api("boom".to_string()));
        assert_eq!(err.stage(), Stage::Attach);
        assert_eq!(err.to_string(), "attach failed for <alpine>: engine API error: boom");
    }
}
