use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use crate::auth::Caller;
use crate::dto::{CreateVpsRequest, CreateVpsResponse, StatsResponse, VpsResponse};
use crate::error::ApiError;
use crate::lifecycle::{self, ActionError, ActionOutcome, LifecycleAction};
use crate::provision;
use crate::state::AppState;

pub async fn create_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateVpsRequest>,
) -> Result<(StatusCode, Json<CreateVpsResponse>), ApiError> {
    let accepted = provision::request_create(&state, &caller, req).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn list_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<VpsResponse>>, ApiError> {
    let records = if caller.is_admin() {
        state.store.list_all().await?
    } else {
        state.store.list_for_owner(caller.user_id).await?
    };
    Ok(Json(
        records
            .into_iter()
            .map(|vps| VpsResponse::for_caller(vps, &caller))
            .collect(),
    ))
}

pub async fn get_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<i64>,
) -> Result<Json<VpsResponse>, ApiError> {
    let vps = lifecycle::load_for(&state, &caller, id)
        .await
        .map_err(|e| match e {
            ActionError::Store(e) => ApiError::Store(e),
            _ => ApiError::NotFound,
        })?;
    Ok(Json(VpsResponse::for_caller(vps, &caller)))
}

pub async fn vps_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<i64>,
) -> Result<Json<StatsResponse>, ActionError> {
    let (vps, stats) = lifecycle::stats(&state, &caller, id).await?;
    Ok(Json(StatsResponse {
        container_id: vps.container_id,
        stats,
    }))
}

pub async fn destroy_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<i64>,
) -> Result<Json<ActionOutcome>, ActionError> {
    lifecycle::destroy(&state, &caller, id).await.map(Json)
}

pub async fn start_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<i64>,
) -> Result<Json<ActionOutcome>, ActionError> {
    lifecycle::perform(&state, &caller, id, LifecycleAction::Start)
        .await
        .map(Json)
}

pub async fn stop_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<i64>,
) -> Result<Json<ActionOutcome>, ActionError> {
    lifecycle::perform(&state, &caller, id, LifecycleAction::Stop)
        .await
        .map(Json)
}

pub async fn restart_vps(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<i64>,
) -> Result<Json<ActionOutcome>, ActionError> {
    lifecycle::perform(&state, &caller, id, LifecycleAction::Restart)
        .await
        .map(Json)
}
