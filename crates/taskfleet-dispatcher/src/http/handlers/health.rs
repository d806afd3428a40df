//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::dispatcher::Dispatcher;

/// Health check endpoint.
pub async fn health_check(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "capacity": dispatcher.config().capacity,
        "active": dispatcher.state().active_count().await,
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&dispatcher).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
