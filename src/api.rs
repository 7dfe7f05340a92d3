//! HTTP + WebSocket router (§6). The REST surface is intentionally small: call-invite
//! actions and a health check. Everything else is a WebSocket upgrade.
//!
//! Grounded in teacher `api.rs`'s `build_router`/`AuthUser` shape, trimmed down from a
//! full Discord-style CRUD surface to the handful of routes SPEC_FULL.md names.

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth;
use crate::call_invites::CallInviteError;
use crate::error::{AppError, AppResult};
use crate::friends_hub::ws_friends;
use crate::room_hub::ws_room;
use crate::state::AppState;
use crate::voice_capture::ws_voice_capture;

/// Resolved bearer identity for the REST surface. WS endpoints authenticate
/// themselves via the `token` query parameter instead, since the WS upgrade
/// handshake happens before any header-based extractor would run usefully.
pub struct AuthUser {
    pub user_id: Uuid,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized)?;
        let claims = auth::validate_token(&state.config.auth, bearer.token())?;
        let user_id = auth::user_id_from_claims(&claims)?;
        Ok(AuthUser { user_id })
    }
}

pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new()
        .route("/ws/rooms/:room_id", get(ws_room))
        .route("/ws/friends", get(ws_friends))
        .route("/ws/voice_capture/:room_id", get(ws_voice_capture));

    let mut rest_routes = Router::new()
        .route("/health", get(health))
        .route("/api/calls/invite", post(invite_call))
        .route("/api/calls/accept", post(accept_call))
        .route("/api/calls/decline", post(decline_call))
        .route("/api/calls/cancel", post(cancel_call))
        .route("/api/calls/pending", get(list_pending_calls));

    if let Some(limiter) = state.rate_limiter.clone() {
        // WS endpoints are excluded — a long-lived connection is rate-limited at
        // accept time only, per §6.
        rest_routes = rest_routes.route_layer(axum::middleware::from_fn_with_state(
            limiter,
            crate::rate_limit::rate_limit_layer,
        ));
    }

    rest_routes
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
struct CallTarget {
    room_id: String,
    to_user_id: Uuid,
    from_username: Option<String>,
    from_email: Option<String>,
}

async fn invite_call(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(body): Json<CallTarget>,
) -> AppResult<impl IntoResponse> {
    state
        .call_invites
        .invite(auth_user.user_id, body.to_user_id, &body.room_id, body.from_username, body.from_email)
        .await
        .map_err(map_call_invite_error)?;
    Ok(Json(json!({"status": "invited"})))
}

#[derive(Debug, Deserialize)]
struct CallAction {
    room_id: String,
    peer_user_id: Uuid,
}

async fn accept_call(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(body): Json<CallAction>,
) -> AppResult<impl IntoResponse> {
    state
        .call_invites
        .accept(body.peer_user_id, auth_user.user_id, &body.room_id)
        .await
        .map_err(map_call_invite_error)?;
    Ok(Json(json!({"status": "accepted"})))
}

async fn decline_call(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(body): Json<CallAction>,
) -> AppResult<impl IntoResponse> {
    state
        .call_invites
        .decline(body.peer_user_id, auth_user.user_id, &body.room_id)
        .await
        .map_err(map_call_invite_error)?;
    Ok(Json(json!({"status": "declined"})))
}

async fn cancel_call(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(body): Json<CallAction>,
) -> AppResult<impl IntoResponse> {
    state
        .call_invites
        .cancel(auth_user.user_id, body.peer_user_id, &body.room_id)
        .await
        .map_err(map_call_invite_error)?;
    Ok(Json(json!({"status": "cancelled"})))
}

async fn list_pending_calls(State(state): State<AppState>, auth_user: AuthUser) -> impl IntoResponse {
    let pending = state.call_invites.list_pending_for(auth_user.user_id).await;
    Json(json!({"pending": pending}))
}

fn map_call_invite_error(e: CallInviteError) -> AppError {
    match e {
        CallInviteError::AlreadyPending => AppError::Conflict(e.to_string()),
        CallInviteError::NotPending => AppError::NotFound(e.to_string()),
    }
}
