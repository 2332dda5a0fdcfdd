pub mod vps;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/vps", post(vps::create_vps).get(vps::list_vps))
        .route("/vps/{id}", get(vps::get_vps).delete(vps::destroy_vps))
        .route("/vps/{id}/stats", get(vps::vps_stats))
        // Direct lifecycle actions
        .route("/vps/{id}/start", post(vps::start_vps))
        .route("/vps/{id}/stop", post(vps::stop_vps))
        .route("/vps/{id}/restart", post(vps::restart_vps))
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let terminal = crate::terminal::terminal_router();

    Router::new()
        .merge(authed)
        .merge(terminal)
        .with_state(state)
}
