//! Control endpoint handlers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use taskfleet_proto::{error_codes, token_matches};

use crate::http::error_response;
use crate::state::AppState;

/// Start the instance and wait until its orchestrator is ready.
pub async fn start(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    info!("Start requested");
    Json(state.lifecycle.start_instance().await).into_response()
}

/// Stop the instance if it has been idle long enough.
pub async fn stop(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    info!("Stop requested");
    Json(state.lifecycle.stop_instance().await).into_response()
}

/// Provider state and orchestrator health.
pub async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.lifecycle.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, "provider_error", Some(e.to_string())),
    }
}

/// Liveness of the compute manager itself.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(&state.api_token, token) => Ok(()),
        _ => {
            warn!("Rejected control request");
            Err(error_response(StatusCode::UNAUTHORIZED, error_codes::UNAUTHORIZED, None))
        }
    }
}
