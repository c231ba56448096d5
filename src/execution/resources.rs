//! Shared volume and network of a run

use crate::core::config::Settings;
use crate::engine::{ContainerEngine, EngineError};
use crate::error::PipelineError;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Volume,
    Network,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Network => write!(f, "network"),
        }
    }
}

#[derive(Debug, Clone)]
struct Resource {
    kind: ResourceKind,
    name: String,
    driver: String,
    reuse: bool,
    remove_first: bool,
    retain: bool,
    /// Created by this run
    acquired: bool,
}

/// Creates the run's volume and network and removes what it created
#[derive(Debug, Clone)]
pub struct ResourceManager {
    volume: Resource,
    network: Resource,
}

impl ResourceManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            volume: Resource {
                kind: ResourceKind::Volume,
                name: settings.volume_name.clone(),
                driver: settings.volume_driver.clone(),
                reuse: settings.reuse_volume,
                remove_first: settings.remove_volume,
                retain: settings.retain_volume,
                acquired: false,
            },
            network: Resource {
                kind: ResourceKind::Network,
                name: settings.network_name.clone(),
                driver: settings.network_driver.clone(),
                reuse: settings.reuse_network,
                remove_first: settings.remove_network,
                retain: settings.retain_network,
                acquired: false,
            },
        }
    }

    /// Volume first, then network. Stops at the first failure.
    pub async fn setup<E: ContainerEngine>(&mut self, engine: &E) -> Result<(), PipelineError> {
        setup_resource(engine, &mut self.volume).await?;
        setup_resource(engine, &mut self.network).await
    }

    /// Network first, then volume. Both are attempted; the first error is returned.
    pub async fn teardown<E: ContainerEngine>(&mut self, engine: &E) -> Result<(), PipelineError> {
        let network = teardown_resource(engine, &mut self.network).await;
        let volume = teardown_resource(engine, &mut self.volume).await;
        network.and(volume)
    }
}

async fn setup_resource<E: ContainerEngine>(engine: &E, resource: &mut Resource) -> Result<(), PipelineError> {
    if resource.reuse {
        debug!("Reusing {} {}", resource.kind, resource.name);
        return Ok(());
    }
    if resource.remove_first && exists(engine, resource).await? {
        info!("Removing existing {} {}", resource.kind, resource.name);
        remove(engine, resource).await?;
    }

    let result = match resource.kind {
        ResourceKind::Volume => engine.create_volume(&resource.name, &resource.driver).await,
        ResourceKind::Network => engine
            .create_network(&resource.name, &resource.driver)
            .await
            .map(|id| debug!("Network {} has ID {}", resource.name, id)),
    };
    result.map_err(|source| resource_error("create", resource, source))?;
    resource.acquired = true;
    info!("Created {} {}", resource.kind, resource.name);
    Ok(())
}

async fn teardown_resource<E: ContainerEngine>(engine: &E, resource: &mut Resource) -> Result<(), PipelineError> {
    if !resource.acquired {
        return Ok(());
    }
    if resource.retain {
        info!("Retaining {} {}", resource.kind, resource.name);
        return Ok(());
    }
    remove(engine, resource).await?;
    resource.acquired = false;
    info!("Removed {} {}", resource.kind, resource.name);
    Ok(())
}

async fn exists<E: ContainerEngine>(engine: &E, resource: &Resource) -> Result<bool, PipelineError> {
    let names = match resource.kind {
        ResourceKind::Volume => engine.list_volumes().await,
        ResourceKind::Network => engine.list_networks().await,
    }
    .map_err(|source| resource_error("list", resource, source))?;
    Ok(names.iter().any(|name| *name == resource.name))
}

async fn remove<E: ContainerEngine>(engine: &E, resource: &Resource) -> Result<(), PipelineError> {
    match resource.kind {
        ResourceKind::Volume => engine.remove_volume(&resource.name).await,
        ResourceKind::Network => engine.remove_network(&resource.name).await,
    }
    .map_err(|source| resource_error("remove", resource, source))
}

fn resource_error(action: &'static str, resource: &Resource, source: EngineError) -> PipelineError {
    PipelineError::Resource {
        action,
        kind: resource.kind,
        name: resource.name.clone(),
        source,
    }
}
