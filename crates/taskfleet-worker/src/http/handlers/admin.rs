//! Admin handlers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use taskfleet_proto::{error_codes, token_matches, RefreshTokenRequest};

use crate::http::error_response;
use crate::state::AppState;

/// Replace the agent OAuth token used by new sessions.
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RefreshTokenRequest>,
) -> Response {
    if !is_admin(&state, &headers) {
        warn!("Rejected admin request");
        return error_response(StatusCode::UNAUTHORIZED, error_codes::UNAUTHORIZED, None);
    }

    if req.token.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            Some("token cannot be empty".to_string()),
        );
    }

    state.orchestrator.refresh_agent_token(req.token).await;
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.admin_token.as_deref() else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token_matches(expected, token))
}
