//! Status webhooks from worker nodes.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::warn;

use taskfleet_proto::{error_codes, SignedHeaders, TaskResponse};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::http::error_response;

/// Apply a signed task status change.
pub async fn task_status_webhook(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, Some(e.to_string()));
        }
    };

    let signed = match SignedHeaders::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok())) {
        Ok(signed) => signed,
        Err(e) => return DispatchError::from(e).into_response(),
    };

    match dispatcher.record_status(&signed, &payload).await {
        Ok(task) => Json(TaskResponse::from(&task)).into_response(),
        Err(e) => {
            if matches!(e, DispatchError::Unauthorized(_)) {
                warn!(error = %e, "Rejected status webhook");
            }
            e.into_response()
        }
    }
}
