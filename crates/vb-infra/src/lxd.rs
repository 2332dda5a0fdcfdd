use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use lxd_cli::LxdClient;
use tracing::{debug, info, warn};

use crate::types::{
    ContainerId, ContainerSpec, ContainerStats, ExecOutput, Feature, ImageRef, LOGIN_SHELL,
    ShellCommand,
};
use crate::{BackendKind, ContainerBackend, Error, Result, env_or, env_secs, images};

#[derive(Debug, Clone)]
pub struct LxdConfig {
    pub program: String,
    pub image_remote: String,
    pub storage_pool: Option<String>,
    pub timeout: Duration,
    pub create_timeout: Duration,
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self {
            program: lxd_cli::DEFAULT_PROGRAM.into(),
            image_remote: "images".into(),
            storage_pool: Some("default".into()),
            timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(300),
        }
    }
}

/// Driver for LXD, whose `lxc list --format json` gives structured state.
pub struct LxdBackend {
    client: LxdClient,
    config: LxdConfig,
}

impl LxdBackend {
    /// Create from env vars: `LXD_BIN`, `LXD_IMAGE_REMOTE`, `LXC_STORAGE`,
    /// `BACKEND_COMMAND_TIMEOUT_SECS`, `BACKEND_CREATE_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let storage = env_or("LXC_STORAGE", "default");
        let config = LxdConfig {
            program: env_or("LXD_BIN", lxd_cli::DEFAULT_PROGRAM),
            image_remote: env_or("LXD_IMAGE_REMOTE", "images"),
            // "none" lets LXD pick the profile's pool.
            storage_pool: (storage != "none").then_some(storage),
            timeout: env_secs("BACKEND_COMMAND_TIMEOUT_SECS", 30)?,
            create_timeout: env_secs("BACKEND_CREATE_TIMEOUT_SECS", 300)?,
        };
        Ok(Self::new(config))
    }

    pub fn new(config: LxdConfig) -> Self {
        let client = LxdClient::new(config.program.clone())
            .with_timeouts(config.timeout, config.create_timeout);
        Self { client, config }
    }

    async fn add_unix_char(&self, id: &ContainerId, device: &str, path: &str) -> Result<()> {
        match self
            .client
            .device_add(id.as_str(), device, "unix-char", &[("path", path)])
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(container_id = %id, device, "lxd: device already present");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContainerBackend for LxdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxd
    }

    async fn check_ready(&self) -> Result<String> {
        Ok(self.client.version().await?)
    }

    fn resolve_image(&self, os: &str, version: Option<&str>) -> ImageRef {
        let release = images::resolve(os, version);
        ImageRef {
            distro: release.distro,
            release: release.version,
            arch: String::new(),
            remote: Some(self.config.image_remote.clone()),
        }
    }

    async fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<()> {
        let image = spec.image.to_string();
        self.client
            .init(&image, id.as_str(), self.config.storage_pool.as_deref())
            .await?;
        info!(container_id = %id, %image, "lxd: instance created");
        Ok(())
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        match self.client.start(id.as_str()).await {
            Ok(()) => {}
            Err(e) if e.is_already_running() => debug!(container_id = %id, "lxd: already running"),
            Err(e) => return Err(e.into()),
        }
        info!(container_id = %id, "lxd: instance started");
        Ok(())
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        match self.client.stop(id.as_str()).await {
            Ok(()) => {}
            Err(e) if e.is_already_stopped() => debug!(container_id = %id, "lxd: already stopped"),
            Err(e) => return Err(e.into()),
        }
        info!(container_id = %id, "lxd: instance stopped");
        Ok(())
    }

    async fn restart(&self, id: &ContainerId) -> Result<()> {
        self.client.restart(id.as_str()).await?;
        info!(container_id = %id, "lxd: instance restarted");
        Ok(())
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        match self.client.delete(id.as_str(), true).await {
            Ok(()) => info!(container_id = %id, "lxd: instance destroyed"),
            Err(e) if e.is_not_found() => {
                warn!(container_id = %id, "lxd: instance already absent, nothing to destroy")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn set_resource_limits(&self, id: &ContainerId, cpu: u32, ram_mb: u32) -> Result<()> {
        self.client
            .config_set(id.as_str(), "limits.cpu", &cpu.to_string())
            .await?;
        self.client
            .config_set(id.as_str(), "limits.memory", &format!("{ram_mb}MB"))
            .await?;
        Ok(())
    }

    async fn resize_disk(&self, id: &ContainerId, disk_gb: u32) -> Result<()> {
        let size = format!("{disk_gb}GB");
        // The root disk normally comes from the profile; override copies it
        // onto the instance. Once copied, set is the only way to change it.
        match self
            .client
            .device_override(id.as_str(), "root", &[("size", size.as_str())])
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                self.client
                    .device_set(id.as_str(), "root", "size", &size)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_feature(&self, id: &ContainerId, feature: Feature) -> Result<()> {
        let name = id.as_str();
        match feature {
            Feature::Nesting => {
                self.client
                    .config_set(name, "security.nesting", "true")
                    .await?;
            }
            Feature::Kvm => self.add_unix_char(id, "kvm", "/dev/kvm").await?,
            Feature::Fuse => self.add_unix_char(id, "fuse", "/dev/fuse").await?,
            Feature::Docker => {
                for (key, value) in [
                    ("security.nesting", "true"),
                    ("security.privileged", "true"),
                    ("security.syscalls.intercept.mknod", "true"),
                    ("security.syscalls.intercept.setxattr", "true"),
                ] {
                    self.client.config_set(name, key, value).await?;
                }
            }
        }
        info!(container_id = %id, %feature, "lxd: feature applied");
        Ok(())
    }

    async fn query_ipv4(&self, id: &ContainerId) -> Result<Option<Ipv4Addr>> {
        let instance = self
            .client
            .instance(id.as_str())
            .await?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        Ok(instance.first_global_ipv4())
    }

    async fn query_stats(&self, id: &ContainerId) -> Result<ContainerStats> {
        let instance = self
            .client
            .instance(id.as_str())
            .await?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        Ok(ContainerStats {
            cpu_time_ns: instance.cpu_usage_ns(),
            memory_bytes: instance.memory_usage_bytes(),
        })
    }

    async fn exec_command(&self, id: &ContainerId, command: &str) -> Result<ExecOutput> {
        let out = self
            .client
            .exec(id.as_str(), &["sh", "-c", command])
            .await?;
        Ok(ExecOutput {
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    fn shell_command(&self, id: &ContainerId) -> ShellCommand {
        ShellCommand {
            program: self.client.program().to_string(),
            args: self
                .client
                .interactive_exec_args(id.as_str(), &["sh", "-c", LOGIN_SHELL]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Features;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Fake `lxc` that appends its argv to `calls.log` and answers from `body`.
    fn fake_lxc(dir: &Path, body: &str) -> String {
        let path = dir.join("lxc");
        let log = dir.join("calls.log");
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn backend(program: String) -> LxdBackend {
        LxdBackend::new(LxdConfig {
            program,
            ..Default::default()
        })
    }

    fn id() -> ContainerId {
        ContainerId("vps-1a2b3c4d-web".into())
    }

    #[test]
    fn resolves_remote_qualified_image() {
        let backend = backend("lxc".into());
        let image = backend.resolve_image("debian", Some("bookworm"));
        assert_eq!(image.to_string(), "images:debian/12");

        let fallback = backend.resolve_image("plan9", None);
        assert_eq!(fallback.to_string(), "images:ubuntu/22.04");
    }

    #[tokio::test]
    async fn create_and_limits_issue_expected_commands() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(dir.path(), "exit 0"));
        let spec = ContainerSpec {
            image: backend.resolve_image("debian", Some("12")),
            cpu: 2,
            ram_mb: 1024,
            disk_gb: 20,
            features: Features::default(),
        };

        backend.create(&id(), &spec).await.unwrap();
        backend.set_resource_limits(&id(), 2, 1024).await.unwrap();

        assert_eq!(
            calls(dir.path()),
            vec![
                "init images:debian/12 vps-1a2b3c4d-web --storage default",
                "config set vps-1a2b3c4d-web limits.cpu 2",
                "config set vps-1a2b3c4d-web limits.memory 1024MB",
            ]
        );
    }

    #[tokio::test]
    async fn destroy_of_absent_instance_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(
            dir.path(),
            "echo 'Error: Failed checking instance exists \"local:vps-1a2b3c4d-web\": Instance not found' >&2\nexit 1",
        ));

        backend.destroy(&id()).await.unwrap();
        backend.destroy(&id()).await.unwrap();
        assert_eq!(calls(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn destroy_surfaces_genuine_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(
            dir.path(),
            "echo 'Error: storage pool is busy' >&2\nexit 1",
        ));

        let err = backend.destroy(&id()).await.unwrap_err();
        assert!(!err.is_container_missing());
    }

    #[tokio::test]
    async fn start_when_already_running_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(
            dir.path(),
            "echo 'Error: The instance is already running' >&2\nexit 1",
        ));
        backend.start(&id()).await.unwrap();
    }

    #[tokio::test]
    async fn resize_falls_back_to_device_set() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(
            dir.path(),
            r#"case "$3" in
  override) echo 'Error: The device already exists' >&2; exit 1 ;;
esac
exit 0"#,
        ));

        backend.resize_disk(&id(), 20).await.unwrap();
        assert_eq!(
            calls(dir.path()),
            vec![
                "config device override vps-1a2b3c4d-web root size=20GB",
                "config device set vps-1a2b3c4d-web root size 20GB",
            ]
        );
    }

    #[tokio::test]
    async fn docker_feature_sets_nesting_and_privileged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(dir.path(), "exit 0"));

        backend.apply_feature(&id(), Feature::Docker).await.unwrap();
        let log = calls(dir.path());
        assert!(log.contains(&"config set vps-1a2b3c4d-web security.nesting true".to_string()));
        assert!(log.contains(&"config set vps-1a2b3c4d-web security.privileged true".to_string()));
    }

    #[tokio::test]
    async fn ip_and_stats_come_from_json_state() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"[{"name":"vps-1a2b3c4d-web","status":"Running","state":{"status":"Running","network":{"lo":{"type":"loopback","addresses":[{"family":"inet","address":"127.0.0.1","scope":"local"}]},"eth0":{"type":"broadcast","addresses":[{"family":"inet6","address":"fd42::1","scope":"global"},{"family":"inet","address":"10.148.20.7","scope":"global"}]}},"cpu":{"usage":5123000000},"memory":{"usage":73400320}}}]"#;
        let backend = backend(fake_lxc(dir.path(), &format!("echo '{json}'")));

        assert_eq!(
            backend.query_ipv4(&id()).await.unwrap(),
            Some(Ipv4Addr::new(10, 148, 20, 7))
        );
        assert_eq!(
            backend.query_stats(&id()).await.unwrap(),
            ContainerStats {
                cpu_time_ns: 5_123_000_000,
                memory_bytes: 73_400_320,
            }
        );
    }

    #[tokio::test]
    async fn ip_is_none_before_dhcp() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"[{"name":"vps-1a2b3c4d-web","status":"Running","state":{"status":"Running","network":{"eth0":{"type":"broadcast","addresses":[{"family":"inet6","address":"fe80::1","scope":"link"}]}}}}]"#;
        let backend = backend(fake_lxc(dir.path(), &format!("echo '{json}'")));

        assert_eq!(backend.query_ipv4(&id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn root_password_goes_through_chpasswd() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(fake_lxc(dir.path(), "exit 0"));

        backend.set_root_password(&id(), "s3cret").await.unwrap();
        assert_eq!(
            calls(dir.path()),
            vec!["exec vps-1a2b3c4d-web -- sh -c echo 'root:s3cret' | chpasswd"]
        );
    }

    #[test]
    fn shell_command_is_interactive_exec() {
        let backend = backend("/usr/bin/lxc".into());
        let shell = backend.shell_command(&id());
        assert_eq!(shell.program, "/usr/bin/lxc");
        assert_eq!(shell.args[0], "exec");
        assert!(shell.args.contains(&"--force-interactive".to_string()));
        assert_eq!(shell.args.last().map(String::as_str), Some(LOGIN_SHELL));
    }
}
