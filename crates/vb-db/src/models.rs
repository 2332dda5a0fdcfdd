use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Stored in `ip_address` once a container is running but has no lease yet.
pub const PENDING_IP: &str = "pending";

const ROOT_PASSWORD_LEN: usize = 16;

// ── VPS instance ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "vps_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VpsState {
    Creating,
    Running,
    Stopped,
    Error,
}

impl VpsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Vps {
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
    pub feat_nesting: bool,
    pub feat_kvm: bool,
    pub feat_fuse: bool,
    pub feat_docker: bool,
    #[serde(skip_serializing)]
    pub root_password: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_action: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVps {
    pub owner_id: i64,
    pub name: String,
    pub hostname: String,
    pub container_id: String,
    pub os: String,
    pub os_version: String,
    pub cpu: i32,
    pub ram_mb: i32,
    pub disk_gb: i32,
    pub feat_nesting: bool,
    pub feat_kvm: bool,
    pub feat_fuse: bool,
    pub feat_docker: bool,
    pub root_password: Option<String>,
    pub notes: Option<String>,
}

/// Partial update of a record's runtime fields. `None` leaves a column as is.
#[derive(Debug, Clone, Default)]
pub struct VpsUpdate {
    pub state: Option<VpsState>,
    pub ip_address: Option<String>,
    /// Bump `last_action` to now.
    pub touch: bool,
}

impl VpsUpdate {
    pub fn state(state: VpsState) -> Self {
        Self {
            state: Some(state),
            ip_address: None,
            touch: true,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

impl Vps {
    /// 16 alphanumeric characters for the container's root account.
    pub fn generate_root_password() -> String {
        use rand::Rng;
        rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(ROOT_PASSWORD_LEN)
            .map(char::from)
            .collect()
    }

    /// Whether the container is up but still waiting for an address.
    pub fn ip_pending(&self) -> bool {
        self.ip_address
            .as_deref()
            .is_none_or(|ip| ip.is_empty() || ip == PENDING_IP)
    }

    /// Insert a record, creating the owner row first if it is unknown.
    pub async fn insert(pool: &PgPool, new: &NewVps) -> sqlx::Result<Self> {
        let mut tx = pool.begin().await?;

        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(new.owner_id)
            .execute(&mut *tx)
            .await?;

        let vps: Self = sqlx::query_as(
            r#"INSERT INTO vps_instances (owner_id, name, hostname, container_id, os, os_version,
                                          cpu, ram_mb, disk_gb, feat_nesting, feat_kvm, feat_fuse,
                                          feat_docker, root_password, notes, state)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 'creating')
               RETURNING *"#,
        )
        .bind(new.owner_id)
        .bind(&new.name)
        .bind(&new.hostname)
        .bind(&new.container_id)
        .bind(&new.os)
        .bind(&new.os_version)
        .bind(new.cpu)
        .bind(new.ram_mb)
        .bind(new.disk_gb)
        .bind(new.feat_nesting)
        .bind(new.feat_kvm)
        .bind(new.feat_fuse)
        .bind(new.feat_docker)
        .bind(&new.root_password)
        .bind(&new.notes)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(vps)
    }

    pub async fn get_by_id(pool: &PgPool, id: i64) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM vps_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn get_by_container_id(pool: &PgPool, container_id: &str) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM vps_instances WHERE container_id = $1")
            .bind(container_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_owner(pool: &PgPool, owner_id: i64) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM vps_instances WHERE owner_id = $1 ORDER BY created_at")
            .bind(owner_id)
            .fetch_all(pool)
            .await
    }

    pub async fn list_all(pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM vps_instances ORDER BY created_at")
            .fetch_all(pool)
            .await
    }

    pub async fn list_by_state(pool: &PgPool, state: VpsState) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM vps_instances WHERE state = $1 ORDER BY created_at")
            .bind(state)
            .fetch_all(pool)
            .await
    }

    /// Apply `update`. Returns `false` if the record no longer exists.
    pub async fn update(pool: &PgPool, id: i64, update: &VpsUpdate) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE vps_instances
               SET state = COALESCE($1, state),
                   ip_address = COALESCE($2, ip_address),
                   last_action = CASE WHEN $3 THEN now() ELSE last_action END
               WHERE id = $4"#,
        )
        .bind(update.state)
        .bind(&update.ip_address)
        .bind(update.touch)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(pool: &PgPool, id: i64) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM vps_instances WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_is_alphanumeric() {
        let pw = Vps::generate_root_password();
        assert_eq!(pw.len(), ROOT_PASSWORD_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pw, Vps::generate_root_password());
    }

    #[test]
    fn state_update_touches() {
        let update = VpsUpdate::state(VpsState::Running).with_ip("10.0.3.9");
        assert_eq!(update.state, Some(VpsState::Running));
        assert_eq!(update.ip_address.as_deref(), Some("10.0.3.9"));
        assert!(update.touch);
    }
}
