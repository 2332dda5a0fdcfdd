use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::{NewVps, Vps, VpsState, VpsUpdate};
use crate::{Error, Result};

/// Data access for VPS records, the only persistence the orchestration
/// code depends on.
#[async_trait]
pub trait VpsStore: Send + Sync + 'static {
    /// Persist a new record in `creating` state.
    async fn insert(&self, new: &NewVps) -> Result<Vps>;

    async fn get(&self, id: i64) -> Result<Option<Vps>>;

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Vps>>;

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Vps>>;

    async fn list_all(&self) -> Result<Vec<Vps>>;

    async fn list_by_state(&self, state: VpsState) -> Result<Vec<Vps>>;

    /// Returns `false` when the record has since been deleted.
    async fn update(&self, id: i64, update: &VpsUpdate) -> Result<bool>;

    async fn delete(&self, id: i64) -> Result<bool>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VpsStore for PgStore {
    async fn insert(&self, new: &NewVps) -> Result<Vps> {
        Vps::insert(&self.pool, new).await.map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::DuplicateContainer(new.container_id.clone())
            }
            other => Error::Database(other),
        })
    }

    async fn get(&self, id: i64) -> Result<Option<Vps>> {
        Ok(Vps::get_by_id(&self.pool, id).await?)
    }

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Vps>> {
        Ok(Vps::get_by_container_id(&self.pool, container_id).await?)
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Vps>> {
        Ok(Vps::list_for_owner(&self.pool, owner_id).await?)
    }

    async fn list_all(&self) -> Result<Vec<Vps>> {
        Ok(Vps::list_all(&self.pool).await?)
    }

    async fn list_by_state(&self, state: VpsState) -> Result<Vec<Vps>> {
        Ok(Vps::list_by_state(&self.pool, state).await?)
    }

    async fn update(&self, id: i64, update: &VpsUpdate) -> Result<bool> {
        Ok(Vps::update(&self.pool, id, update).await?)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        Ok(Vps::delete(&self.pool, id).await?)
    }
}
