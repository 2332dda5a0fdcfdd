mod auth;
mod config;
mod dto;
mod error;
mod lifecycle;
mod monitor;
mod provision;
mod pty;
mod routes;
mod state;
mod terminal;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use vb_db::{PgStore, VpsStore};

use crate::config::AppConfig;
use crate::monitor::spawn_monitor;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Database
    let db = vb_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");

    vb_db::run_migrations(&db)
        .await
        .expect("failed to run migrations");

    let store: Arc<dyn VpsStore> = Arc::new(PgStore::new(db));

    // Container runtime
    let backend = vb_infra::build_backend().expect("failed to build container backend");
    match backend.check_ready().await {
        Ok(version) => tracing::info!(backend = %backend.kind(), %version, "container runtime ready"),
        Err(e) => tracing::warn!(backend = %backend.kind(), error = %e, "container runtime not reachable"),
    }

    // Background monitor
    spawn_monitor(store.clone(), backend.clone(), config.monitor_interval_secs);

    let state = AppState {
        store,
        backend,
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting vps control plane");

    axum::serve(listener, app).await.expect("server error");
}
