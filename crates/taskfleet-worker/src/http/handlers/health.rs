//! Health handler.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::state::AppState;

/// Capacity and load of this node.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.health().await)
}
