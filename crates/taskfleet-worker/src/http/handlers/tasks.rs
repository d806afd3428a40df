//! Task dispatch, status and cancellation handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::{info, warn};

use taskfleet_core::TaskId;
use taskfleet_proto::{cancel_payload, error_codes, DispatchRequest, TaskAccepted, TaskResponse};

use crate::http::{error_response, verify_signed};
use crate::orchestrator::OrchestratorError;
use crate::state::AppState;

/// Accept a signed dispatch envelope.
///
/// The signature is checked against the raw JSON value before the body is
/// interpreted as a task.
pub async fn dispatch_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, Some(e.to_string()));
        }
    };

    if let Err(rejection) = verify_signed(&state, &headers, &payload) {
        return rejection;
    }

    let task = match serde_json::from_value::<DispatchRequest>(payload)
        .map_err(|e| e.to_string())
        .and_then(|req| req.into_task().map_err(|e| e.to_string()))
    {
        Ok(task) => task,
        Err(message) => {
            warn!(error = %message, "Invalid dispatch request");
            return error_response(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, Some(message));
        }
    };

    match state.orchestrator.accept(task).await {
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(TaskAccepted {
                task_id: accepted.task.id.to_string(),
                status: accepted.task.status,
                duplicate: accepted.duplicate,
            }),
        )
            .into_response(),
        Err(e @ OrchestratorError::AtCapacity { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, error_codes::AT_CAPACITY, Some(e.to_string()))
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, Some(e.to_string())),
    }
}

/// Current status of a task.
pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let task = match TaskId::parse(id) {
        Ok(id) => state.orchestrator.get(&id).await,
        Err(_) => None,
    };

    match task {
        Some(task) => Json(TaskResponse::from(&task)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, None),
    }
}

/// Cancel a task. The signed payload is `{"taskId": "<id>"}`.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Ok(task_id) = TaskId::parse(id) else {
        return error_response(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, None);
    };

    if let Err(rejection) = verify_signed(&state, &headers, &cancel_payload(&task_id)) {
        return rejection;
    }

    match state.orchestrator.cancel(&task_id).await {
        Ok(task) => {
            info!(task_id = %task_id, status = %task.status, "Cancel request handled");
            Json(TaskResponse::from(&task)).into_response()
        }
        Err(OrchestratorError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, None)
        }
        Err(e) => error_response(StatusCode::CONFLICT, error_codes::INVALID_REQUEST, Some(e.to_string())),
    }
}
