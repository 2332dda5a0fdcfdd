//! Detached provisioning: a record is persisted in `creating` state, then a
//! background task drives the backend through each step and converges the
//! record to `running` or `error`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;
use vb_db::{NewVps, PENDING_IP, Vps, VpsState, VpsStore, VpsUpdate};
use vb_infra::ContainerBackend;
use vb_infra::types::{ContainerId, ContainerSpec, Features};

use crate::auth::Caller;
use crate::dto::{CreateVpsRequest, CreateVpsResponse};
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_OS: &str = "ubuntu";
const DEFAULT_OS_VERSION: &str = "22.04";
const DEFAULT_CPU: u32 = 1;
const DEFAULT_RAM_MB: u32 = 512;
const DEFAULT_DISK_GB: u32 = 10;

/// Longest instance name both runtimes accept.
const MAX_CONTAINER_ID_LEN: usize = 63;

/// A step failure that aborts the pipeline.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct StepError {
    pub step: &'static str,
    #[source]
    pub source: vb_infra::Error,
}

fn fatal(step: &'static str) -> impl FnOnce(vb_infra::Error) -> StepError {
    move |source| StepError { step, source }
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn VpsStore>,
    backend: Arc<dyn ContainerBackend>,
    ip_attempts: u32,
    ip_interval: Duration,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn VpsStore>,
        backend: Arc<dyn ContainerBackend>,
        ip_attempts: u32,
        ip_interval: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            ip_attempts: ip_attempts.max(1),
            ip_interval,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.store.clone(),
            state.backend.clone(),
            state.config.ip_discovery_attempts,
            state.config.ip_discovery_interval,
        )
    }

    /// Run the pipeline for `vps` on its own task.
    pub fn spawn(self, vps: Vps) -> JoinHandle<VpsState> {
        tokio::spawn(async move { self.run(&vps).await })
    }

    /// Provision `vps` and write the outcome back to the store. Returns the
    /// state the record was converged to.
    pub async fn run(&self, vps: &Vps) -> VpsState {
        let (state, update) = match self.provision(vps).await {
            Ok(ip) => {
                let ip = ip.map(|ip| ip.to_string()).unwrap_or_else(|| PENDING_IP.into());
                info!(vps_id = vps.id, container_id = %vps.container_id, %ip, "provisioning complete");
                (VpsState::Running, VpsUpdate::state(VpsState::Running).with_ip(ip))
            }
            Err(e) => {
                error!(
                    vps_id = vps.id,
                    container_id = %vps.container_id,
                    step = e.step,
                    error = %e.source,
                    "provisioning failed"
                );
                (VpsState::Error, VpsUpdate::state(VpsState::Error))
            }
        };

        match self.store.update(vps.id, &update).await {
            Ok(true) => {}
            Ok(false) => warn!(vps_id = vps.id, "record deleted during provisioning"),
            Err(e) => error!(vps_id = vps.id, error = %e, "failed to record provisioning outcome"),
        }
        state
    }

    async fn provision(&self, vps: &Vps) -> Result<Option<Ipv4Addr>, StepError> {
        let id = ContainerId(vps.container_id.clone());
        let backend = &self.backend;

        let image = backend.resolve_image(&vps.os, Some(&vps.os_version));
        let spec = ContainerSpec {
            image,
            cpu: to_u32(vps.cpu, DEFAULT_CPU),
            ram_mb: to_u32(vps.ram_mb, DEFAULT_RAM_MB),
            disk_gb: to_u32(vps.disk_gb, DEFAULT_DISK_GB),
            features: Features {
                nesting: vps.feat_nesting,
                kvm: vps.feat_kvm,
                fuse: vps.feat_fuse,
                docker: vps.feat_docker,
            },
        };
        info!(container_id = %id, image = %spec.image, "provisioning started");

        backend.create(&id, &spec).await.map_err(fatal("create"))?;

        backend
            .set_resource_limits(&id, spec.cpu, spec.ram_mb)
            .await
            .map_err(fatal("resource limits"))?;

        if let Err(e) = backend.resize_disk(&id, spec.disk_gb).await {
            warn!(container_id = %id, disk_gb = spec.disk_gb, error = %e, "disk resize skipped");
        }

        for feature in spec.features.requested() {
            match backend.apply_feature(&id, feature).await {
                Ok(()) => {}
                Err(e) if e.is_container_missing() => return Err(fatal("features")(e)),
                Err(e) => warn!(container_id = %id, %feature, error = %e, "feature not applied"),
            }
        }

        backend.start(&id).await.map_err(fatal("start"))?;

        let ip = self.discover_ipv4(&id).await;

        if let Some(password) = vps.root_password.as_deref()
            && let Err(e) = backend.set_root_password(&id, password).await
        {
            warn!(container_id = %id, error = %e, "root password not set");
        }

        Ok(ip)
    }

    /// Poll for an address a bounded number of times. No address is an
    /// expected outcome right after start.
    async fn discover_ipv4(&self, id: &ContainerId) -> Option<Ipv4Addr> {
        for attempt in 1..=self.ip_attempts {
            match self.backend.query_ipv4(id).await {
                Ok(Some(ip)) => return Some(ip),
                Ok(None) => {}
                Err(e) => warn!(container_id = %id, attempt, error = %e, "address query failed"),
            }
            if attempt < self.ip_attempts {
                tokio::time::sleep(self.ip_interval).await;
            }
        }
        warn!(container_id = %id, "no address yet, recording placeholder");
        None
    }
}

fn to_u32(value: i32, default: u32) -> u32 {
    u32::try_from(value).ok().filter(|v| *v > 0).unwrap_or(default)
}

/// Lowercase `name`, map anything outside `[a-z0-9]` to `-`, and collapse
/// runs of dashes.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// `{prefix}-{8 hex}-{sanitized name}`, cut to the runtimes' name limit.
pub fn container_id_for(prefix: &str, name: &str) -> String {
    let short = Uuid::new_v4().simple().to_string();
    let mut id = format!("{}-{}", prefix, &short[..8]);
    let suffix = sanitize(name);
    if !suffix.is_empty() {
        id.push('-');
        id.push_str(&suffix);
    }
    let mut cut = MAX_CONTAINER_ID_LEN.min(id.len());
    while !id.is_char_boundary(cut) {
        cut -= 1;
    }
    id.truncate(cut);
    id.trim_end_matches('-').to_string()
}

fn validate(req: &CreateVpsRequest) -> Result<(), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    if let Some(cpu) = req.cpu
        && !(1..=64).contains(&cpu)
    {
        return Err(ApiError::BadRequest("cpu must be between 1 and 64".into()));
    }
    if let Some(ram) = req.ram_mb
        && !(64..=262_144).contains(&ram)
    {
        return Err(ApiError::BadRequest("ram must be between 64 and 262144 MB".into()));
    }
    if let Some(disk) = req.disk_gb
        && !(1..=2048).contains(&disk)
    {
        return Err(ApiError::BadRequest("disk must be between 1 and 2048 GB".into()));
    }
    if let Some(pw) = &req.root_password
        && (pw.is_empty() || pw.contains(['\n', '\r', '\0']))
    {
        return Err(ApiError::BadRequest("root password must be a non-empty single line".into()));
    }
    Ok(())
}

/// Persist a new record in `creating` state and hand it to a background
/// pipeline. Returns as soon as the record exists.
pub async fn request_create(
    state: &AppState,
    caller: &Caller,
    req: CreateVpsRequest,
) -> Result<CreateVpsResponse, ApiError> {
    validate(&req)?;

    let container_id = container_id_for(&state.config.container_prefix, &req.name);
    let hostname = req
        .hostname
        .as_deref()
        .map(sanitize)
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| container_id.clone());
    let root_password = match req.root_password {
        Some(pw) => Some(pw),
        None if req.generate_password => Some(Vps::generate_root_password()),
        None => None,
    };
    let os = req
        .os
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_OS.into());
    let os_version = req
        .os_version
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_OS_VERSION.into());

    let new = NewVps {
        owner_id: caller.user_id,
        name: req.name.trim().to_string(),
        hostname,
        container_id,
        os,
        os_version,
        cpu: req.cpu.unwrap_or(DEFAULT_CPU) as i32,
        ram_mb: req.ram_mb.unwrap_or(DEFAULT_RAM_MB) as i32,
        disk_gb: req.disk_gb.unwrap_or(DEFAULT_DISK_GB) as i32,
        feat_nesting: req.features.nesting,
        feat_kvm: req.features.kvm,
        feat_fuse: req.features.fuse,
        feat_docker: req.features.docker,
        root_password,
        notes: req.notes,
    };

    let vps = state.store.insert(&new).await?;
    info!(vps_id = vps.id, container_id = %vps.container_id, owner_id = vps.owner_id, "vps accepted");

    let response = CreateVpsResponse {
        accepted: true,
        record_id: vps.id,
        container_id: vps.container_id.clone(),
        state: vps.state,
    };
    Pipeline::from_state(state).spawn(vps);
    Ok(response)
}
