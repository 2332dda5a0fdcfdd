pub mod images;
pub mod lxc;
pub mod lxd;
pub mod types;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{
    ContainerId, ContainerSpec, ContainerStats, ExecOutput, Feature, ImageRef, ShellCommand,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lxd: {0}")]
    Lxd(#[from] lxd_cli::Error),

    #[error("lxc: {0}")]
    Lxc(#[from] lxc_cli::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid value for {name}: {value}")]
    InvalidConfig { name: String, value: String },

    #[error("unknown container backend: {0}")]
    UnknownBackend(String),
}

impl Error {
    /// The runtime reports the addressed container does not exist.
    pub fn is_container_missing(&self) -> bool {
        match self {
            Error::Lxd(e) => e.is_not_found(),
            Error::Lxc(e) => e.is_not_found(),
            Error::ContainerNotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Supported container runtime families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// LXD (or Incus) driven through its `lxc` client with JSON output.
    Lxd,
    /// Classic LXC driven through the `lxc-*` tools and cgroup files.
    Lxc,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lxd => "lxd",
            Self::Lxc => "lxc",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lxd" | "incus" => Ok(Self::Lxd),
            "lxc" => Ok(Self::Lxc),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

/// Runtime-agnostic interface for managing tenant containers.
///
/// Every operation returns a `Result`; subprocess failures, timeouts and
/// unparseable output all come back as `Err`, never as a panic.
#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    /// Which runtime family this driver talks to.
    fn kind(&self) -> BackendKind;

    /// Check the runtime's client tools are reachable. Returns the version.
    async fn check_ready(&self) -> Result<String>;

    /// Map a human OS name and version to this runtime's image address.
    /// Never fails; unknown distros fall back to the default image.
    fn resolve_image(&self, os: &str, version: Option<&str>) -> ImageRef;

    /// Provision a stopped container from `spec.image`.
    async fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<()>;

    /// Start a container. Already running counts as success.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stop a container. Already stopped counts as success.
    async fn stop(&self, id: &ContainerId) -> Result<()>;

    async fn restart(&self, id: &ContainerId) -> Result<()>;

    /// Force-destroy a container, running or not. An absent container is
    /// not an error.
    async fn destroy(&self, id: &ContainerId) -> Result<()>;

    /// CPU share count and hard memory ceiling in MB.
    async fn set_resource_limits(&self, id: &ContainerId, cpu: u32, ram_mb: u32) -> Result<()>;

    /// Resize the root disk. Callers treat failure as a warning.
    async fn resize_disk(&self, id: &ContainerId, disk_gb: u32) -> Result<()>;

    /// Apply a single isolation relaxation.
    async fn apply_feature(&self, id: &ContainerId, feature: Feature) -> Result<()>;

    /// First global IPv4 on a non-loopback interface, `None` while unassigned.
    async fn query_ipv4(&self, id: &ContainerId) -> Result<Option<Ipv4Addr>>;

    async fn query_stats(&self, id: &ContainerId) -> Result<ContainerStats>;

    /// Run `command` through `sh -c` inside the container.
    async fn exec_command(&self, id: &ContainerId, command: &str) -> Result<ExecOutput>;

    /// Host program that opens an interactive login shell in the container.
    fn shell_command(&self, id: &ContainerId) -> ShellCommand;

    /// Set the root password through `chpasswd`.
    async fn set_root_password(&self, id: &ContainerId, password: &str) -> Result<()> {
        let line = format!("root:{password}");
        let command = format!("echo {} | chpasswd", types::shell_quote(&line));
        self.exec_command(id, &command).await?;
        Ok(())
    }
}

/// Read a duration in whole seconds from `name`, falling back to `default`.
pub(crate) fn env_secs(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| Error::InvalidConfig {
                name: name.into(),
                value: raw,
            }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

pub(crate) fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Build the single driver selected by `CONTAINER_BACKEND` (default `lxd`).
///
/// The choice is process-wide; there is no per-container backend.
pub fn build_backend() -> Result<Arc<dyn ContainerBackend>> {
    dotenvy::dotenv().ok();

    let kind: BackendKind = env_or("CONTAINER_BACKEND", BackendKind::Lxd.as_str()).parse()?;

    let backend: Arc<dyn ContainerBackend> = match kind {
        BackendKind::Lxd => Arc::new(lxd::LxdBackend::from_env()?),
        BackendKind::Lxc => Arc::new(lxc::LxcBackend::from_env()?),
    };

    tracing::info!(backend = %kind, "container backend selected");
    Ok(backend)
}
