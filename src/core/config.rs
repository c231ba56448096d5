//! Pipeline definition loaded from YAML

use crate::core::environment::EnvEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or checking a pipeline definition
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{kind} at index <{index}> is missing {field}")]
    MissingField {
        kind: &'static str,
        index: usize,
        field: &'static str,
    },

    #[error("duplicate {kind} name <{name}>")]
    DuplicateName { kind: &'static str, name: String },

    #[error("repository <{0}> needs an explicit directory other than <.> when more than one repository is declared")]
    AmbiguousDirectory(String),

    #[error("setting <{0}> is invalid: {1}")]
    InvalidSetting(&'static str, String),

    #[error("invalid environment entry <{entry}> in {scope}")]
    InvalidEnvironment { entry: String, scope: String },

    #[error("{0}")]
    NotAllowed(String),
}

/// Run-wide settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of the volume shared by every container of the run
    pub volume_name: String,
    pub volume_driver: String,
    /// Name of the network services and steps attach to
    pub network_name: String,
    pub network_driver: String,
    /// Mount point of the shared volume, also the default working directory
    pub working_directory: String,
    /// Shell used by steps that do not declare their own
    pub shell: Vec<String>,
    /// Deadline for the whole run, in seconds
    pub timeout: u64,
    pub reuse_volume: bool,
    pub remove_volume: bool,
    pub retain_volume: bool,
    pub reuse_network: bool,
    pub remove_network: bool,
    pub retain_network: bool,
    pub allow_privileged: bool,
    pub allow_docker_sock: bool,
    pub allow_ssh_agent: bool,
    /// Image used for clone, fetch and checkout containers
    pub git_image: String,
    /// Image used for the file injection and extraction containers
    pub utility_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume_name: "myvolume".to_string(),
            volume_driver: "local".to_string(),
            network_name: "mynetwork".to_string(),
            network_driver: "bridge".to_string(),
            working_directory: "/src".to_string(),
            shell: vec!["sh".to_string()],
            timeout: 3600,
            reuse_volume: false,
            remove_volume: false,
            retain_volume: false,
            reuse_network: false,
            remove_network: false,
            retain_network: false,
            allow_privileged: false,
            allow_docker_sock: false,
            allow_ssh_agent: false,
            git_image: "alpine/git".to_string(),
            utility_image: "alpine".to_string(),
        }
    }
}

impl Settings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// A source repository cloned into the shared volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub name: String,
    /// Anything `git clone` accepts
    pub location: String,
    /// Clone target below the working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    pub shallow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl Repository {
    /// The ref to check out after cloning. Branch wins over tag, tag over commit.
    pub fn git_ref(&self) -> Option<&str> {
        [&self.branch, &self.tag, &self.commit]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|r| !r.is_empty())
    }

    /// Directory (relative to the working directory) the clone ends up in
    pub fn checkout_directory(&self) -> String {
        match self.directory.as_deref() {
            Some(dir) if !dir.is_empty() => dir.to_string(),
            _ => humanish_name(&self.location),
        }
    }
}

/// The directory name `git clone` derives from a repository location
fn humanish_name(location: &str) -> String {
    let trimmed = location.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');
    trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// A background container that lives for the duration of the steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub name: String,
    pub image: String,
    pub environment: Vec<String>,
    pub privileged: bool,
    /// Do not print the service's output when it is stopped
    pub suppress_log: bool,
}

/// Raw YAML shape of a file entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// A file movement between the host and the shared volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FileEntry", into = "FileEntry")]
pub enum FileTransfer {
    /// Copy every host path matching the glob into the volume
    InjectGlob(String),
    /// Write a literal string as a file in the volume
    InjectContent { name: String, content: String },
    /// Copy a volume path out to a host destination
    Extract { path: String, destination: String },
}

impl FileTransfer {
    pub fn is_inject(&self) -> bool {
        !matches!(self, FileTransfer::Extract { .. })
    }
}

impl TryFrom<FileEntry> for FileTransfer {
    type Error = String;

    fn try_from(entry: FileEntry) -> Result<Self, Self::Error> {
        match (entry.inject, entry.extract) {
            (Some(_), Some(_)) => Err("a file entry cannot both inject and extract".to_string()),
            (Some(inject), None) if inject.is_empty() => Err("inject must not be empty".to_string()),
            (Some(_), None) if entry.destination.is_some() => {
                Err("destination only applies to extract entries".to_string())
            }
            (Some(name), None) => Ok(match entry.content {
                Some(content) => FileTransfer::InjectContent { name, content },
                None => FileTransfer::InjectGlob(name),
            }),
            (None, Some(path)) if path.is_empty() => Err("extract must not be empty".to_string()),
            (None, Some(_)) if entry.content.is_some() => {
                Err("content only applies to inject entries".to_string())
            }
            (None, Some(path)) => Ok(FileTransfer::Extract {
                path,
                destination: entry
                    .destination
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| ".".to_string()),
            }),
            (None, None) => Err("a file entry needs either inject or extract".to_string()),
        }
    }
}

impl From<FileTransfer> for FileEntry {
    fn from(transfer: FileTransfer) -> Self {
        match transfer {
            FileTransfer::InjectGlob(pattern) => FileEntry {
                inject: Some(pattern),
                ..Default::default()
            },
            FileTransfer::InjectContent { name, content } => FileEntry {
                inject: Some(name),
                content: Some(content),
                ..Default::default()
            },
            FileTransfer::Extract { path, destination } => FileEntry {
                extract: Some(path),
                destination: Some(destination),
                ..Default::default()
            },
        }
    }
}

/// One build step, run in its own container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    pub name: String,
    pub image: String,
    /// Overrides `settings.shell` when not empty
    pub shell: Vec<String>,
    /// Use the shell as the entrypoint instead of the command
    pub override_entrypoint: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub environment: Vec<String>,
    /// Lines written to the shell's standard input
    pub commands: Vec<String>,
    pub mount_docker_sock: bool,
    pub forward_ssh_agent: bool,
}

/// Complete pipeline definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefinition {
    pub settings: Settings,
    #[serde(rename = "repos")]
    pub repositories: Vec<Repository>,
    pub files: Vec<FileTransfer>,
    pub services: Vec<Service>,
    pub environment: Vec<String>,
    pub steps: Vec<Step>,
}

fn env_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("environment name pattern is valid")
    })
}

impl PipelineDefinition {
    /// A definition with default settings and nothing to do
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Load and validate a definition from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let definition: PipelineDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Structural checks: required fields, unique names, repository layout
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;

        let mut names = HashSet::new();
        for (index, repo) in self.repositories.iter().enumerate() {
            require("repository", index, "a name", &repo.name)?;
            require("repository", index, "a location", &repo.location)?;
            if !names.insert(repo.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "repository",
                    name: repo.name.clone(),
                });
            }
            if self.repositories.len() > 1 {
                match repo.directory.as_deref() {
                    Some(dir) if !dir.is_empty() && dir != "." => {}
                    _ => return Err(ConfigError::AmbiguousDirectory(repo.name.clone())),
                }
            }
        }

        check_environment(&self.environment, "global environment")?;

        let mut names = HashSet::new();
        for (index, service) in self.services.iter().enumerate() {
            require("service", index, "a name", &service.name)?;
            require("service", index, "an image", &service.image)?;
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "service",
                    name: service.name.clone(),
                });
            }
            check_environment(&service.environment, &format!("service <{}>", service.name))?;
        }

        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            require("step", index, "a name", &step.name)?;
            require("step", index, "an image", &step.image)?;
            if step.commands.is_empty() {
                return Err(ConfigError::MissingField {
                    kind: "step",
                    index,
                    field: "commands",
                });
            }
            if !names.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "step",
                    name: step.name.clone(),
                });
            }
            check_environment(&step.environment, &format!("build step <{}>", step.name))?;
        }

        Ok(())
    }

    /// Checks that every privileged request is allowed by the settings
    pub fn authorize(&self) -> Result<(), ConfigError> {
        let settings = &self.settings;
        if let Some(service) = self
            .services
            .iter()
            .find(|s| s.privileged && !settings.allow_privileged)
        {
            return Err(ConfigError::NotAllowed(format!(
                "service <{}> requests a privileged container but privileged containers are not allowed",
                service.name
            )));
        }
        if let Some(step) = self
            .steps
            .iter()
            .find(|s| s.mount_docker_sock && !settings.allow_docker_sock)
        {
            return Err(ConfigError::NotAllowed(format!(
                "build step <{}> requests the docker socket but mounting it is not allowed",
                step.name
            )));
        }
        if let Some(step) = self
            .steps
            .iter()
            .find(|s| s.forward_ssh_agent && !settings.allow_ssh_agent)
        {
            return Err(ConfigError::NotAllowed(format!(
                "build step <{}> requests the SSH agent but forwarding it is not allowed",
                step.name
            )));
        }
        Ok(())
    }

    pub fn injections(&self) -> Vec<FileTransfer> {
        self.files.iter().filter(|f| f.is_inject()).cloned().collect()
    }

    pub fn extractions(&self) -> Vec<FileTransfer> {
        self.files.iter().filter(|f| !f.is_inject()).cloned().collect()
    }

    fn validate_settings(&self) -> Result<(), ConfigError> {
        let s = &self.settings;
        for (name, value) in [
            ("volume_name", &s.volume_name),
            ("volume_driver", &s.volume_driver),
            ("network_name", &s.network_name),
            ("network_driver", &s.network_driver),
            ("git_image", &s.git_image),
            ("utility_image", &s.utility_image),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidSetting(name, "must not be empty".to_string()));
            }
        }
        if !s.working_directory.starts_with('/') {
            return Err(ConfigError::InvalidSetting(
                "working_directory",
                format!("<{}> is not an absolute path", s.working_directory),
            ));
        }
        if s.shell.is_empty() {
            return Err(ConfigError::InvalidSetting("shell", "must not be empty".to_string()));
        }
        if s.timeout == 0 {
            return Err(ConfigError::InvalidSetting("timeout", "must be positive".to_string()));
        }
        if s.reuse_volume && s.remove_volume {
            return Err(ConfigError::InvalidSetting(
                "reuse_volume",
                "cannot reuse and remove the volume at the same time".to_string(),
            ));
        }
        if s.reuse_network && s.remove_network {
            return Err(ConfigError::InvalidSetting(
                "reuse_network",
                "cannot reuse and remove the network at the same time".to_string(),
            ));
        }
        Ok(())
    }
}

fn require(kind: &'static str, index: usize, field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField { kind, index, field });
    }
    Ok(())
}

fn check_environment(entries: &[String], scope: &str) -> Result<(), ConfigError> {
    for entry in entries {
        if !env_name_pattern().is_match(EnvEntry::parse(entry).name()) {
            return Err(ConfigError::InvalidEnvironment {
                entry: entry.clone(),
                scope: scope.to_string(),
            });
        }
    }
    Ok(())
}
