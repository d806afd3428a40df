//! Task submission, status and cancellation handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use taskfleet_core::TaskId;
use taskfleet_proto::{error_codes, TaskResponse, TaskSubmission};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::http::error_response;

/// Admit a task and dispatch it to a node.
pub async fn submit_task(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> Response {
    let submission: TaskSubmission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, Some(e.to_string()));
        }
    };

    match dispatcher.submit(submission).await {
        Ok(task) => (StatusCode::ACCEPTED, Json(TaskResponse::from(&task))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Last known status of a task.
pub async fn get_task(State(dispatcher): State<Arc<Dispatcher>>, Path(id): Path<String>) -> Response {
    match parse_id(id) {
        Ok(task_id) => respond(dispatcher.get(&task_id).await),
        Err(e) => e.into_response(),
    }
}

/// Cancel a task on its node.
pub async fn cancel_task(State(dispatcher): State<Arc<Dispatcher>>, Path(id): Path<String>) -> Response {
    match parse_id(id) {
        Ok(task_id) => respond(dispatcher.cancel(&task_id).await),
        Err(e) => e.into_response(),
    }
}

/// Unparseable ids cannot name a known task.
fn parse_id(id: String) -> Result<TaskId, DispatchError> {
    TaskId::parse(id.clone()).map_err(|_| DispatchError::NotFound(TaskId::new(id)))
}

fn respond(result: Result<taskfleet_core::Task, DispatchError>) -> Response {
    match result {
        Ok(task) => Json(TaskResponse::from(&task)).into_response(),
        Err(e) => e.into_response(),
    }
}
