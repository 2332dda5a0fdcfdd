use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vb_db::{Vps, VpsState};
use vb_infra::types::{ContainerStats, Features};

use crate::auth::Caller;

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateVpsRequest {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default, alias = "version")]
    pub os_version: Option<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default, alias = "ram")]
    pub ram_mb: Option<u32>,
    #[serde(default, alias = "disk")]
    pub disk_gb: Option<u32>,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub root_password: Option<String>,
    /// Ask the service to pick a root password.
    #[serde(default)]
    pub generate_password: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CreateVpsResponse {
    pub accepted: bool,
    pub record_id: i64,
    pub container_id: String,
    pub state: VpsState,
}

#[derive(Debug, Serialize)]
pub struct VpsResponse {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub hostname: String,
    pub container_id: String,
    pub os: String,
    pub os_version: String,
    pub cpu: i32,
    pub ram_mb: i32,
    pub disk_gb: i32,
    pub ip_address: Option<String>,
    pub state: VpsState,
    pub features: Features,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_action: DateTime<Utc>,
}

impl VpsResponse {
    /// Render a record for `caller`. The root credential is only shown to
    /// the owning tenant, not to administrators browsing other accounts.
    pub fn for_caller(vps: Vps, caller: &Caller) -> Self {
        let root_password = if caller.owns(&vps) {
            vps.root_password
        } else {
            None
        };
        Self {
            id: vps.id,
            owner_id: vps.owner_id,
            name: vps.name,
            hostname: vps.hostname,
            container_id: vps.container_id,
            os: vps.os,
            os_version: vps.os_version,
            cpu: vps.cpu,
            ram_mb: vps.ram_mb,
            disk_gb: vps.disk_gb,
            ip_address: vps.ip_address,
            state: vps.state,
            features: Features {
                nesting: vps.feat_nesting,
                kvm: vps.feat_kvm,
                fuse: vps.feat_fuse,
                docker: vps.feat_docker,
            },
            root_password,
            notes: vps.notes,
            created_at: vps.created_at,
            last_action: vps.last_action,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub container_id: String,
    #[serde(flatten)]
    pub stats: ContainerStats,
}
