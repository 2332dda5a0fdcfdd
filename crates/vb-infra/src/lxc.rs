use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use lxc_cli::{ConfigBlock, DownloadImage, LxcClient};
use tracing::{debug, info, warn};

use crate::types::{
    ContainerId, ContainerSpec, ContainerStats, ExecOutput, Feature, ImageRef, LOGIN_SHELL,
    ShellCommand,
};
use crate::{BackendKind, ContainerBackend, Error, Result, env_or, env_secs, images};

/// CFS period the CPU quota is expressed against.
const CFS_PERIOD_US: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct LxcConfig {
    pub tools_dir: Option<PathBuf>,
    pub lxc_path: PathBuf,
    pub cgroup_root: PathBuf,
    pub bridge: String,
    pub gateway: String,
    pub dns: String,
    pub arch: String,
    pub validate_images: bool,
    pub timeout: Duration,
    pub create_timeout: Duration,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            tools_dir: None,
            lxc_path: "/var/lib/lxc".into(),
            cgroup_root: "/sys/fs/cgroup".into(),
            bridge: "lxcbr0".into(),
            gateway: "10.0.3.1".into(),
            dns: "8.8.8.8".into(),
            arch: "amd64".into(),
            validate_images: false,
            timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(300),
        }
    }
}

/// Driver for classic LXC: text-only `lxc-*` tools, a flat config file per
/// container, and accounting read straight from the cgroup tree.
pub struct LxcBackend {
    client: LxcClient,
    config: LxcConfig,
}

impl LxcBackend {
    /// Create from env vars: `LXC_TOOLS_DIR`, `LXC_PATH`, `LXC_CGROUP_ROOT`,
    /// `LXC_BRIDGE`, `LXC_GATEWAY`, `LXC_DNS`, `LXC_ARCH`,
    /// `LXC_VALIDATE_IMAGES`, plus the shared backend timeouts.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let validate_images = match std::env::var("LXC_VALIDATE_IMAGES") {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "" | "0" | "false" | "no" => false,
                _ => {
                    return Err(Error::InvalidConfig {
                        name: "LXC_VALIDATE_IMAGES".into(),
                        value: raw,
                    });
                }
            },
            Err(_) => false,
        };

        let config = LxcConfig {
            tools_dir: std::env::var("LXC_TOOLS_DIR").ok().map(PathBuf::from),
            lxc_path: env_or("LXC_PATH", "/var/lib/lxc").into(),
            cgroup_root: env_or("LXC_CGROUP_ROOT", "/sys/fs/cgroup").into(),
            bridge: env_or("LXC_BRIDGE", "lxcbr0"),
            gateway: env_or("LXC_GATEWAY", "10.0.3.1"),
            dns: env_or("LXC_DNS", "8.8.8.8"),
            arch: env_or("LXC_ARCH", "amd64"),
            validate_images,
            timeout: env_secs("BACKEND_COMMAND_TIMEOUT_SECS", 30)?,
            create_timeout: env_secs("BACKEND_CREATE_TIMEOUT_SECS", 300)?,
        };
        Ok(Self::new(config))
    }

    pub fn new(config: LxcConfig) -> Self {
        let mut client = LxcClient::new(&config.lxc_path, &config.cgroup_root)
            .with_timeouts(config.timeout, config.create_timeout);
        if let Some(dir) = &config.tools_dir {
            client = client.with_tools_dir(dir);
        }
        Self { client, config }
    }

    fn network_block(&self) -> ConfigBlock {
        ConfigBlock::new("network")
            .entry("lxc.net.0.type", "veth")
            .entry("lxc.net.0.link", &self.config.bridge)
            .entry("lxc.net.0.flags", "up")
            .entry("lxc.net.0.ipv4.gateway", &self.config.gateway)
    }

    fn limits_block(cpu: u32, ram_mb: u32) -> ConfigBlock {
        let cpu = u64::from(cpu);
        let ram_mb = u64::from(ram_mb);
        ConfigBlock::new("resources")
            .entry("lxc.cgroup.cpu.shares", cpu * 1024)
            .entry("lxc.cgroup.cpu.cfs_quota_us", cpu * CFS_PERIOD_US)
            .entry("lxc.cgroup.cpu.cfs_period_us", CFS_PERIOD_US)
            .entry("lxc.cgroup.memory.limit_in_bytes", format!("{ram_mb}M"))
            .entry("lxc.cgroup.memory.memsw.limit_in_bytes", format!("{}M", ram_mb * 2))
            // Unified hierarchy. LXC skips whichever set the host does not mount.
            .entry("lxc.cgroup2.cpu.weight", (cpu * 100).min(10_000))
            .entry("lxc.cgroup2.cpu.max", format!("{} {CFS_PERIOD_US}", cpu * CFS_PERIOD_US))
            .entry("lxc.cgroup2.memory.max", format!("{ram_mb}M"))
            .entry("lxc.cgroup2.memory.swap.max", format!("{ram_mb}M"))
    }

    fn feature_block(feature: Feature) -> ConfigBlock {
        let block = ConfigBlock::new(feature.as_str());
        match feature {
            Feature::Nesting => block
                .entry("lxc.apparmor.profile", "generated")
                .entry("lxc.apparmor.allow_nesting", 1)
                .entry("lxc.mount.auto", "proc:rw sys:rw cgroup:mixed"),
            Feature::Kvm => block
                .entry("lxc.cgroup.devices.allow", "c 10:232 rwm")
                .entry("lxc.cgroup.devices.allow", "c 10:200 rwm")
                .entry("lxc.mount.entry", "/dev/kvm dev/kvm none bind,optional,create=file")
                .entry(
                    "lxc.mount.entry",
                    "/dev/net/tun dev/net/tun none bind,optional,create=file",
                ),
            Feature::Fuse => block
                .entry("lxc.cgroup.devices.allow", "c 10:229 rwm")
                .entry("lxc.mount.entry", "/dev/fuse dev/fuse none bind,optional,create=file"),
            Feature::Docker => block
                .entry("lxc.apparmor.profile", "unconfined")
                .entry("lxc.cgroup.devices.allow", "a")
                .entry("lxc.cap.drop", ""),
        }
    }

    async fn ensure_defined(&self, id: &ContainerId) -> Result<()> {
        if self.client.exists(id.as_str()).await? {
            Ok(())
        } else {
            Err(Error::ContainerNotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerBackend for LxcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxc
    }

    async fn check_ready(&self) -> Result<String> {
        Ok(self.client.version().await?)
    }

    fn resolve_image(&self, os: &str, version: Option<&str>) -> ImageRef {
        let release = images::resolve(os, version);
        ImageRef {
            release: release.release_name().to_string(),
            distro: release.distro,
            arch: self.config.arch.clone(),
            remote: None,
        }
    }

    async fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<()> {
        let image = DownloadImage {
            distro: spec.image.distro.clone(),
            release: spec.image.release.clone(),
            arch: spec.image.arch.clone(),
        };
        self.client
            .create_download(id.as_str(), &image, self.config.validate_images)
            .await?;
        info!(container_id = %id, image = %spec.image, "lxc: container created");

        self.client
            .append_config(id.as_str(), &self.network_block())
            .await?;

        let resolv = format!("nameserver {}\n", self.config.dns);
        if let Err(e) = self
            .client
            .write_rootfs_file(id.as_str(), Path::new("etc/resolv.conf"), &resolv)
            .await
        {
            warn!(container_id = %id, error = %e, "lxc: could not write resolv.conf");
        }
        Ok(())
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        match self.client.start(id.as_str()).await {
            Ok(()) => {}
            Err(e) if e.is_already_running() => debug!(container_id = %id, "lxc: already running"),
            Err(e) => return Err(e.into()),
        }
        info!(container_id = %id, "lxc: container started");
        Ok(())
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        match self.client.stop(id.as_str()).await {
            Ok(()) => {}
            Err(e) if e.is_not_running() => debug!(container_id = %id, "lxc: already stopped"),
            Err(e) => return Err(e.into()),
        }
        info!(container_id = %id, "lxc: container stopped");
        Ok(())
    }

    async fn restart(&self, id: &ContainerId) -> Result<()> {
        self.stop(id).await?;
        self.start(id).await
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        if !self.client.exists(id.as_str()).await? {
            warn!(container_id = %id, "lxc: container already absent, nothing to destroy");
            return Ok(());
        }
        match self.client.destroy(id.as_str()).await {
            Ok(()) => info!(container_id = %id, "lxc: container destroyed"),
            Err(e) if e.is_not_found() => {
                warn!(container_id = %id, "lxc: container vanished during destroy")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn set_resource_limits(&self, id: &ContainerId, cpu: u32, ram_mb: u32) -> Result<()> {
        self.client
            .append_config(id.as_str(), &Self::limits_block(cpu, ram_mb))
            .await?;
        Ok(())
    }

    async fn resize_disk(&self, _id: &ContainerId, _disk_gb: u32) -> Result<()> {
        // Directory-backed rootfs has no size to change.
        Err(Error::Unsupported("root disk resize".into()))
    }

    async fn apply_feature(&self, id: &ContainerId, feature: Feature) -> Result<()> {
        self.client
            .append_config(id.as_str(), &Self::feature_block(feature))
            .await?;
        info!(container_id = %id, %feature, "lxc: feature applied");
        Ok(())
    }

    async fn query_ipv4(&self, id: &ContainerId) -> Result<Option<Ipv4Addr>> {
        let info = self.client.info(id.as_str()).await?;
        Ok(info.first_global_ipv4())
    }

    async fn query_stats(&self, id: &ContainerId) -> Result<ContainerStats> {
        self.ensure_defined(id).await?;
        let counters = self.client.counters(id.as_str()).await;
        Ok(ContainerStats {
            cpu_time_ns: counters.cpu_ns,
            memory_bytes: counters.memory_bytes,
        })
    }

    async fn exec_command(&self, id: &ContainerId, command: &str) -> Result<ExecOutput> {
        let (stdout, stderr) = self
            .client
            .attach(id.as_str(), &["sh", "-c", command])
            .await?;
        Ok(ExecOutput { stdout, stderr })
    }

    fn shell_command(&self, id: &ContainerId) -> ShellCommand {
        let (program, args) = self
            .client
            .interactive_attach(id.as_str(), &["sh", "-c", LOGIN_SHELL]);
        ShellCommand { program, args }
    }
}
