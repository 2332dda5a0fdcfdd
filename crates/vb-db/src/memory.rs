use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{NewVps, Vps, VpsState, VpsUpdate};
use crate::store::VpsStore;
use crate::{Error, Result};

/// Process-local store with the same semantics as `PgStore`. Used for
/// single-node development without a database and in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, Vps>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test thread; the map is intact.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collect(&self, keep: impl Fn(&Vps) -> bool) -> Vec<Vps> {
        self.lock().rows.values().filter(|v| keep(v)).cloned().collect()
    }
}

#[async_trait]
impl VpsStore for MemoryStore {
    async fn insert(&self, new: &NewVps) -> Result<Vps> {
        let mut inner = self.lock();
        if inner.rows.values().any(|v| v.container_id == new.container_id) {
            return Err(Error::DuplicateContainer(new.container_id.clone()));
        }
        inner.next_id += 1;
        let now = Utc::now();
        let vps = Vps {
            id: inner.next_id,
            owner_id: new.owner_id,
            name: new.name.clone(),
            hostname: new.hostname.clone(),
            container_id: new.container_id.clone(),
            os: new.os.clone(),
            os_version: new.os_version.clone(),
            cpu: new.cpu,
            ram_mb: new.ram_mb,
            disk_gb: new.disk_gb,
            ip_address: None,
            state: VpsState::Creating,
            feat_nesting: new.feat_nesting,
            feat_kvm: new.feat_kvm,
            feat_fuse: new.feat_fuse,
            feat_docker: new.feat_docker,
            root_password: new.root_password.clone(),
            notes: new.notes.clone(),
            created_at: now,
            last_action: now,
        };
        inner.rows.insert(vps.id, vps.clone());
        Ok(vps)
    }

    async fn get(&self, id: i64) -> Result<Option<Vps>> {
        Ok(self.lock().rows.get(&id).cloned())
    }

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Vps>> {
        Ok(self.collect(|v| v.container_id == container_id).into_iter().next())
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Vps>> {
        Ok(self.collect(|v| v.owner_id == owner_id))
    }

    async fn list_all(&self) -> Result<Vec<Vps>> {
        Ok(self.collect(|_| true))
    }

    async fn list_by_state(&self, state: VpsState) -> Result<Vec<Vps>> {
        Ok(self.collect(|v| v.state == state))
    }

    async fn update(&self, id: i64, update: &VpsUpdate) -> Result<bool> {
        let mut inner = self.lock();
        let Some(vps) = inner.rows.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(state) = update.state {
            vps.state = state;
        }
        if let Some(ip) = &update.ip_address {
            vps.ip_address = Some(ip.clone());
        }
        if update.touch {
            vps.last_action = Utc::now();
        }
        Ok(true)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        Ok(self.lock().rows.remove(&id).is_some())
    }
}
