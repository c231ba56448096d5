//! CLI command definitions

use crate::core::Settings;
use clap::Args;

/// Run a pipeline
#[derive(Debug, Args, Clone, Default)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long, default_value = "insulate.yaml")]
    pub file: String,

    /// Reuse an existing volume and network
    #[arg(long, conflicts_with_all = ["remove", "remove_volume", "remove_network"])]
    pub reuse: bool,

    /// Reuse an existing volume
    #[arg(long, conflicts_with_all = ["remove", "remove_volume"])]
    pub reuse_volume: bool,

    /// Reuse an existing network
    #[arg(long, conflicts_with_all = ["remove", "remove_network"])]
    pub reuse_network: bool,

    /// Remove a leftover volume and network before starting
    #[arg(long)]
    pub remove: bool,

    /// Remove a leftover volume before starting
    #[arg(long)]
    pub remove_volume: bool,

    /// Remove a leftover network before starting
    #[arg(long)]
    pub remove_network: bool,

    /// Keep the volume after the run
    #[arg(long)]
    pub retain_volume: bool,

    /// Keep the network after the run
    #[arg(long)]
    pub retain_network: bool,

    /// Allow steps to mount the Docker socket
    #[arg(long)]
    pub allow_docker_sock: bool,

    /// Allow privileged services
    #[arg(long)]
    pub allow_privileged: bool,

    /// Allow steps to use the host SSH agent
    #[arg(long)]
    pub allow_ssh_agent: bool,

    /// Overall run timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl RunCommand {
    /// Apply the command-line overrides on top of the file settings.
    /// Flags only switch options on.
    pub fn apply(&self, settings: &mut Settings) {
        settings.reuse_volume |= self.reuse || self.reuse_volume;
        settings.reuse_network |= self.reuse || self.reuse_network;
        settings.remove_volume |= self.remove || self.remove_volume;
        settings.remove_network |= self.remove || self.remove_network;
        settings.retain_volume |= self.retain_volume;
        settings.retain_network |= self.retain_network;
        settings.allow_docker_sock |= self.allow_docker_sock;
        settings.allow_privileged |= self.allow_privileged;
        settings.allow_ssh_agent |= self.allow_ssh_agent;
        if let Some(timeout) = self.timeout {
            settings.timeout = timeout;
        }
    }
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long, default_value = "insulate.yaml")]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
