use std::sync::Arc;
use std::time::Duration;

use vb_db::{VpsState, VpsStore, VpsUpdate};
use vb_infra::ContainerBackend;
use vb_infra::types::ContainerId;

/// Spawn the background monitor. Each tick fills in addresses for running
/// records that were provisioned before their container got a lease.
pub fn spawn_monitor(store: Arc<dyn VpsStore>, backend: Arc<dyn ContainerBackend>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            match backfill_addresses(&*store, &*backend).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(updated = n, "monitor: addresses backfilled"),
                Err(e) => tracing::error!(error = %e, "monitor: address backfill failed"),
            }
        }
    });
}

/// Query the backend for every running record whose address is still
/// missing or pending. Returns how many records gained an address.
pub async fn backfill_addresses(store: &dyn VpsStore, backend: &dyn ContainerBackend) -> vb_db::Result<usize> {
    let running = store.list_by_state(VpsState::Running).await?;
    let mut updated = 0;

    for vps in running.iter().filter(|v| v.ip_pending()) {
        let id = ContainerId(vps.container_id.clone());
        match backend.query_ipv4(&id).await {
            Ok(Some(ip)) => {
                let update = VpsUpdate {
                    ip_address: Some(ip.to_string()),
                    ..Default::default()
                };
                if store.update(vps.id, &update).await? {
                    tracing::debug!(vps_id = vps.id, container_id = %id, %ip, "monitor: address found");
                    updated += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(vps_id = vps.id, container_id = %id, error = %e, "monitor: address query failed");
            }
        }
    }
    Ok(updated)
}
