use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{info, warn};
use vb_db::{Vps, VpsState, VpsUpdate};
use vb_infra::types::{ContainerId, ContainerStats};

use crate::auth::Caller;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    fn target_state(&self) -> VpsState {
        match self {
            Self::Start | Self::Restart => VpsState::Running,
            Self::Stop => VpsState::Stopped,
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Restart => "restarted",
        }
    }
}

/// The answer to every direct action: a success flag and a message that is
/// never empty on failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActionOutcome {
    pub ok: bool,
    pub message: String,
}

impl ActionOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("VPS not found")]
    NotFound,

    #[error("{0}")]
    Backend(#[from] vb_infra::Error),

    #[error("store error: {0}")]
    Store(#[from] vb_db::Error),
}

impl ActionError {
    pub fn outcome(&self) -> ActionOutcome {
        ActionOutcome {
            ok: false,
            message: self.to_string(),
        }
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ActionError::NotFound => StatusCode::NOT_FOUND,
            ActionError::Backend(_) => StatusCode::BAD_GATEWAY,
            ActionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.outcome())).into_response()
    }
}

/// Fetch a record the caller may act on. Foreign records look absent.
pub async fn load_for(state: &AppState, caller: &Caller, id: i64) -> Result<Vps, ActionError> {
    match state.store.get(id).await? {
        Some(vps) if caller.can_access(&vps) => Ok(vps),
        _ => Err(ActionError::NotFound),
    }
}

/// Run a start/stop/restart against the backend, then record the new state.
/// On backend failure the record is left untouched.
pub async fn perform(
    state: &AppState,
    caller: &Caller,
    id: i64,
    action: LifecycleAction,
) -> Result<ActionOutcome, ActionError> {
    let vps = load_for(state, caller, id).await?;
    let container = ContainerId(vps.container_id.clone());

    let result = match action {
        LifecycleAction::Start => state.backend.start(&container).await,
        LifecycleAction::Stop => state.backend.stop(&container).await,
        LifecycleAction::Restart => state.backend.restart(&container).await,
    };
    if let Err(e) = result {
        warn!(vps_id = id, container_id = %container, action = action.as_str(), error = %e, "action failed");
        return Err(e.into());
    }

    let mut update = VpsUpdate::state(action.target_state());
    if action != LifecycleAction::Stop {
        match state.backend.query_ipv4(&container).await {
            Ok(Some(ip)) => update = update.with_ip(ip.to_string()),
            Ok(None) => {}
            Err(e) => warn!(container_id = %container, error = %e, "address refresh failed"),
        }
    }

    if !state.store.update(id, &update).await? {
        return Err(ActionError::NotFound);
    }

    info!(vps_id = id, container_id = %container, action = action.as_str(), "action complete");
    Ok(ActionOutcome::ok(format!("VPS {}", action.past_tense())))
}

/// Tear down the container, then remove the record. An already absent
/// container does not block removal; any other backend failure does.
pub async fn destroy(state: &AppState, caller: &Caller, id: i64) -> Result<ActionOutcome, ActionError> {
    let vps = load_for(state, caller, id).await?;
    let container = ContainerId(vps.container_id.clone());

    match state.backend.destroy(&container).await {
        Ok(()) => {}
        Err(e) if e.is_container_missing() => {
            warn!(container_id = %container, "container already gone, removing record")
        }
        Err(e) => {
            warn!(vps_id = id, container_id = %container, error = %e, "destroy failed, keeping record");
            return Err(e.into());
        }
    }

    state.store.delete(id).await?;
    info!(vps_id = id, container_id = %container, "vps destroyed");
    Ok(ActionOutcome::ok("VPS destroyed"))
}

pub async fn stats(state: &AppState, caller: &Caller, id: i64) -> Result<(Vps, ContainerStats), ActionError> {
    let vps = load_for(state, caller, id).await?;
    let stats = state
        .backend
        .query_stats(&ContainerId(vps.container_id.clone()))
        .await?;
    Ok((vps, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::testing::{FakeBackend, new_vps, test_state};
    use std::sync::Arc;

    const OWNER: Caller = Caller {
        user_id: 1,
        role: Role::User,
    };

    #[tokio::test]
    async fn stop_then_start_updates_state_and_address() {
        let backend = Arc::new(FakeBackend::new());
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(1, "vps-l1")).await.unwrap();

        let out = perform(&state, &OWNER, vps.id, LifecycleAction::Stop).await.unwrap();
        assert_eq!(out, ActionOutcome::ok("VPS stopped"));
        assert_eq!(state.store.get(vps.id).await.unwrap().unwrap().state, VpsState::Stopped);

        perform(&state, &OWNER, vps.id, LifecycleAction::Start).await.unwrap();
        let stored = state.store.get(vps.id).await.unwrap().unwrap();
        assert_eq!(stored.state, VpsState::Running);
        assert_eq!(stored.ip_address.as_deref(), Some("10.0.3.10"));
    }

    #[tokio::test]
    async fn backend_failure_leaves_state_and_reports_message() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_on("restart");
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(1, "vps-l2")).await.unwrap();

        let err = perform(&state, &OWNER, vps.id, LifecycleAction::Restart)
            .await
            .unwrap_err();
        let outcome = err.outcome();
        assert!(!outcome.ok);
        assert!(!outcome.message.is_empty());
        assert_eq!(state.store.get(vps.id).await.unwrap().unwrap().state, VpsState::Creating);
    }

    #[tokio::test]
    async fn foreign_records_are_not_found() {
        let backend = Arc::new(FakeBackend::new());
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(2, "vps-l3")).await.unwrap();

        let err = perform(&state, &OWNER, vps.id, LifecycleAction::Stop).await.unwrap_err();
        assert!(matches!(err, ActionError::NotFound));
        assert!(backend.calls().is_empty());

        let admin = Caller {
            user_id: 99,
            role: Role::Admin,
        };
        perform(&state, &admin, vps.id, LifecycleAction::Stop).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_removes_record_after_backend_teardown() {
        let backend = Arc::new(FakeBackend::new());
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(1, "vps-l4")).await.unwrap();

        destroy(&state, &OWNER, vps.id).await.unwrap();
        assert!(state.store.get(vps.id).await.unwrap().is_none());
        assert_eq!(backend.calls(), vec!["destroy vps-l4"]);
    }

    #[tokio::test]
    async fn destroy_proceeds_when_container_is_absent() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_missing_on("destroy");
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(1, "vps-l5")).await.unwrap();

        destroy(&state, &OWNER, vps.id).await.unwrap();
        assert!(state.store.get(vps.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_keeps_record_on_genuine_failure() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_on("destroy");
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(1, "vps-l6")).await.unwrap();

        let err = destroy(&state, &OWNER, vps.id).await.unwrap_err();
        assert!(matches!(err, ActionError::Backend(_)));
        assert!(state.store.get(vps.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_come_from_backend() {
        let backend = Arc::new(FakeBackend::new());
        let state = test_state(backend.clone());
        let vps = state.store.insert(&new_vps(1, "vps-l7")).await.unwrap();

        let (_, stats) = stats(&state, &OWNER, vps.id).await.unwrap();
        assert_eq!(stats.cpu_time_ns, 1_000_000);
        assert_eq!(stats.memory_bytes, 4096);
    }
}
