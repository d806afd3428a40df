//! Node list handler.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use taskfleet_core::WorkerType;

use crate::dispatcher::Dispatcher;

/// One configured node with its current load as seen by the dispatcher.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub name: String,
    pub url: String,
    pub worker_types: Vec<WorkerType>,
    pub ephemeral: bool,
    pub active_tasks: usize,
}

/// List configured nodes as JSON.
pub async fn list_nodes(State(dispatcher): State<Arc<Dispatcher>>) -> impl IntoResponse {
    let tasks = dispatcher.state().tasks.read().await;
    let response: Vec<NodeResponse> = dispatcher
        .config()
        .nodes
        .iter()
        .map(|node| NodeResponse {
            name: node.name.to_string(),
            url: node.url.clone(),
            worker_types: node.worker_types.clone(),
            ephemeral: node.ephemeral,
            active_tasks: tasks
                .values()
                .filter(|t| t.status.is_active() && t.node.as_ref() == Some(&node.name))
                .count(),
        })
        .collect();
    Json(response)
}
