//! In-process doubles shared by the unit tests.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vb_db::{MemoryStore, NewVps, Vps, VpsState};
use vb_infra::types::{
    ContainerId, ContainerSpec, ContainerStats, ExecOutput, Feature, ImageRef, ShellCommand,
};
use vb_infra::{BackendKind, ContainerBackend, Error, Result, images};

use crate::config::AppConfig;
use crate::state::AppState;

enum Failure {
    Unsupported,
    Missing,
}

/// Records every call as a line of text and fails calls whose line starts
/// with a configured prefix.
pub struct FakeBackend {
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, Failure)>>,
    ip: Mutex<Option<Ipv4Addr>>,
    shell: Mutex<Option<ShellCommand>>,
    shell_spawns: Mutex<usize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            ip: Mutex::new(Some(Ipv4Addr::new(10, 0, 3, 10))),
            shell: Mutex::new(None),
            shell_spawns: Mutex::new(0),
        }
    }

    pub fn fail_on(&self, prefix: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((prefix.to_string(), Failure::Unsupported));
    }

    /// Fail calls matching `prefix` as if the container did not exist.
    pub fn fail_missing_on(&self, prefix: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((prefix.to_string(), Failure::Missing));
    }

    pub fn set_ip(&self, ip: Option<Ipv4Addr>) {
        *self.ip.lock().unwrap() = ip;
    }

    pub fn set_shell(&self, shell: ShellCommand) {
        *self.shell.lock().unwrap() = Some(shell);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn shell_spawns(&self) -> usize {
        *self.shell_spawns.lock().unwrap()
    }

    fn record(&self, call: String) -> Result<()> {
        let result = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| call.starts_with(prefix.as_str()))
            .map(|(_, failure)| match failure {
                Failure::Unsupported => Err(Error::Unsupported(call.clone())),
                Failure::Missing => Err(Error::ContainerNotFound(call.clone())),
            })
            .unwrap_or(Ok(()));
        self.calls.lock().unwrap().push(call);
        result
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lxd
    }

    async fn check_ready(&self) -> Result<String> {
        Ok("fake".into())
    }

    fn resolve_image(&self, os: &str, version: Option<&str>) -> ImageRef {
        let release = images::resolve(os, version);
        ImageRef {
            distro: release.distro.to_string(),
            release: release.release_name().to_string(),
            arch: "amd64".into(),
            remote: None,
        }
    }

    async fn create(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<()> {
        self.record(format!(
            "create {id} {}/{} cpu={} ram={}",
            spec.image.distro, spec.image.release, spec.cpu, spec.ram_mb
        ))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.record(format!("start {id}"))
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        self.record(format!("stop {id}"))
    }

    async fn restart(&self, id: &ContainerId) -> Result<()> {
        self.record(format!("restart {id}"))
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.record(format!("destroy {id}"))
    }

    async fn set_resource_limits(&self, id: &ContainerId, cpu: u32, ram_mb: u32) -> Result<()> {
        self.record(format!("limits {id} {cpu} {ram_mb}"))
    }

    async fn resize_disk(&self, id: &ContainerId, disk_gb: u32) -> Result<()> {
        self.record(format!("resize {id} {disk_gb}"))
    }

    async fn apply_feature(&self, id: &ContainerId, feature: Feature) -> Result<()> {
        self.record(format!("feature {feature} {id}"))
    }

    async fn query_ipv4(&self, id: &ContainerId) -> Result<Option<Ipv4Addr>> {
        self.record(format!("ipv4 {id}"))?;
        Ok(*self.ip.lock().unwrap())
    }

    async fn query_stats(&self, id: &ContainerId) -> Result<ContainerStats> {
        self.record(format!("stats {id}"))?;
        Ok(ContainerStats {
            cpu_time_ns: 1_000_000,
            memory_bytes: 4096,
        })
    }

    async fn exec_command(&self, id: &ContainerId, command: &str) -> Result<ExecOutput> {
        self.record(format!("exec {id} {command}"))?;
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn shell_command(&self, _id: &ContainerId) -> ShellCommand {
        *self.shell_spawns.lock().unwrap() += 1;
        self.shell.lock().unwrap().clone().unwrap_or_else(|| ShellCommand {
            program: "/bin/sh".into(),
            args: Vec::new(),
        })
    }
}

pub fn new_vps(owner_id: i64, container_id: &str) -> NewVps {
    NewVps {
        owner_id,
        name: container_id.to_string(),
        hostname: container_id.to_string(),
        container_id: container_id.to_string(),
        os: "ubuntu".into(),
        os_version: "22.04".into(),
        cpu: 1,
        ram_mb: 512,
        disk_gb: 10,
        feat_nesting: false,
        feat_kvm: false,
        feat_fuse: false,
        feat_docker: false,
        root_password: None,
        notes: None,
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://unused".into(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        control_plane_api_key: "test-key".into(),
        jwt_secret: "test-secret".into(),
        monitor_interval_secs: 60,
        container_prefix: "vps".into(),
        ip_discovery_attempts: 3,
        ip_discovery_interval: Duration::from_millis(1),
    }
}

pub fn test_state(backend: Arc<FakeBackend>) -> AppState {
    AppState {
        store: Arc::new(MemoryStore::new()),
        backend,
        config: test_config(),
    }
}

/// Poll the store until record `id` reaches `want`.
pub async fn wait_for_state(state: &AppState, id: i64, want: VpsState) -> Vps {
    let poll = async {
        loop {
            if let Some(vps) = state.store.get(id).await.unwrap()
                && vps.state == want
            {
                return vps;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("record {id} never reached {}", want.as_str()))
}
