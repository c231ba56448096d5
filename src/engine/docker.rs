//! Docker backend built on bollard

use crate::engine::{
    encode_frame, ByteStream, ContainerEngine, ContainerSpec, EngineError, InputStream, MountKind,
    PathKind, PathStat, ProgressStream, StreamKind,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    DownloadFromContainerOptions, LogOutput, LogsOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, Mount, MountTypeEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::debug;

impl From<DockerError> for EngineError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            other => EngineError::Api(other.to_string()),
        }
    }
}

/// Container engine talking to a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub async fn connect() -> Result<Self, EngineError> {
        let client = Docker::connect_with_local_defaults()?
            .negotiate_version()
            .await?;
        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<ProgressStream, EngineError> {
        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let progress = self
            .client
            .create_image(Some(options), None, None)
            .map(|item| {
                item.map(|info| info.status.unwrap_or_default())
                    .map_err(EngineError::from)
            });
        Ok(progress.boxed())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mounts = spec
            .mounts
            .iter()
            .map(|mount| Mount {
                target: Some(mount.target.clone()),
                source: Some(mount.source.clone()),
                typ: Some(match mount.kind {
                    MountKind::Volume => MountTypeEnum::VOLUME,
                    MountKind::Bind => MountTypeEnum::BIND,
                }),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(network.clone(), EndpointSettings::default())]),
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            env: Some(spec.env.clone()),
            attach_stdin: Some(spec.open_stdin),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.open_stdin),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options: Option<CreateContainerOptions<String>> =
            spec.name.as_ref().map(|name| CreateContainerOptions {
                name: name.clone(),
                platform: None,
            });

        let response = self.client.create_container(options, config).await?;
        for warning in &response.warnings {
            debug!("Create warning for {}: {}", spec.image, warning);
        }
        Ok(response.id)
    }

    async fn attach_stdin(&self, id: &str) -> Result<InputStream, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { input, .. } =
            self.client.attach_container(id, Some(options)).await?;
        Ok(input)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut statuses = Box::pin(self.client.wait_container(id, Some(options)));
        match statuses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(err.into()),
            None => Err(EngineError::Api(format!(
                "wait for container {} ended without a status",
                id
            ))),
        }
    }

    async fn container_logs(&self, id: &str, follow: bool) -> Result<ByteStream, EngineError> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let output = self
            .client
            .logs(id, Some(options))
            .map(|item| item.map(frame_log_output).map_err(EngineError::from));
        Ok(output.boxed())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.client
            .stop_container(id, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn stat_path(&self, id: &str, path: &str) -> Result<PathStat, EngineError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut chunks = Box::pin(self.client.download_from_container(id, Some(options)));
        let mut buffer = Vec::new();
        while let Some(chunk) = chunks.next().await {
            buffer.extend_from_slice(&chunk?);
            if let Some(stat) = read_first_entry(&buffer) {
                return Ok(stat);
            }
        }
        Err(EngineError::NotFound(format!("{} in container {}", path, id)))
    }

    async fn copy_to_container(&self, id: &str, dir: &str, archive: Vec<u8>) -> Result<(), EngineError> {
        let options = UploadToContainerOptions {
            path: dir.to_string(),
            no_overwrite_dir_non_dir: "true".to_string(),
        };
        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<(ByteStream, PathStat), EngineError> {
        let stat = self.stat_path(id, path).await?;
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let content = self
            .client
            .download_from_container(id, Some(options))
            .map(|chunk| chunk.map_err(EngineError::from));
        Ok((content.boxed(), stat))
    }

    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), EngineError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            ..Default::default()
        };
        self.client.create_volume(options).await?;
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>, EngineError> {
        let response = self
            .client
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.client
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await?;
        Ok(())
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<String, EngineError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            ..Default::default()
        };
        let response = self.client.create_network(options).await?;
        Ok(response.id.unwrap_or_default())
    }

    async fn list_networks(&self) -> Result<Vec<String>, EngineError> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks.into_iter().filter_map(|network| network.name).collect())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.client.remove_network(name).await?;
        Ok(())
    }
}

/// Split `repo[:tag]` into repository and tag, defaulting the tag to `latest`.
/// A registry port (`host:5000/repo`) is not a tag.
fn split_image_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rfind(':') {
        Some(pos) => {
            let split = image.len() - last_segment.len() + pos;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Put bollard's decoded log chunks back into the multiplexed frame format
fn frame_log_output(output: LogOutput) -> Bytes {
    let (kind, message) = match output {
        LogOutput::StdIn { message } => (StreamKind::Stdin, message),
        LogOutput::StdOut { message } => (StreamKind::Stdout, message),
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::Console { message } => (StreamKind::Stdout, message),
    };
    Bytes::from(encode_frame(kind, &message))
}

/// Metadata of the first entry of a (possibly partial) tar archive
fn read_first_entry(buffer: &[u8]) -> Option<PathStat> {
    let mut archive = tar::Archive::new(buffer);
    let mut entries = archive.entries().ok()?;
    let entry = entries.next()?.ok()?;

    let header = entry.header();
    let entry_type = header.entry_type();
    let kind = if entry_type.is_dir() {
        PathKind::Directory
    } else if entry_type.is_symlink() {
        PathKind::Symlink
    } else if entry_type.is_file() {
        PathKind::File
    } else {
        PathKind::Other
    };

    Some(PathStat {
        name: entry
            .path()
            .map(|p| p.to_string_lossy().trim_end_matches('/').to_string())
            .unwrap_or_default(),
        size: entry.size(),
        mode: header.mode().unwrap_or(0),
        kind,
        link_target: entry
            .link_name()
            .ok()
            .flatten()
            .map(|target| target.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })
}
