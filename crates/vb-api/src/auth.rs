use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use vb_db::Vps;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(r) if r.eq_ignore_ascii_case("admin") => Self::Admin,
            _ => Self::User,
        }
    }
}

/// The authenticated tenant a request acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners see their own records, administrators see everything.
    pub fn can_access(&self, vps: &Vps) -> bool {
        self.is_admin() || vps.owner_id == self.user_id
    }

    pub fn owns(&self, vps: &Vps) -> bool {
        vps.owner_id == self.user_id
    }
}

/// Middleware that validates `Authorization: Bearer <key>` against the
/// configured `CONTROL_PLANE_API_KEY` and extracts `X-User-Id` and
/// `X-User-Role` into a [`Caller`].
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match validate_request(&state, req.headers()) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

fn validate_request(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;

    if token != state.config.control_plane_api_key {
        return Err(ApiError::Unauthorized);
    }

    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(ApiError::BadRequest("missing or invalid X-User-Id header".into()))?;

    let role = Role::parse(headers.get("x-user-role").and_then(|v| v.to_str().ok()));

    Ok(Caller { user_id, role })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Claims carried by terminal session tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Numeric user id.
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: usize,
}

/// Authenticate a terminal WebSocket request from a JWT passed either as
/// the `token` query parameter (browsers cannot set headers on upgrade) or
/// as a bearer header.
pub fn authenticate_terminal_request(
    headers: &HeaderMap,
    query_token: Option<&str>,
    secret: &str,
) -> Option<Caller> {
    let token = query_token.or_else(|| bearer_token(headers))?;

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| tracing::debug!(error = %e, "rejected terminal token"))
    .ok()?;

    let user_id = data.claims.sub.parse().ok()?;
    Some(Caller {
        user_id,
        role: Role::parse(data.claims.role.as_deref()),
    })
}
