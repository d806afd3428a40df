//! HTTP server for the dispatcher.
//!
//! Provides endpoints for:
//! - Task submission, status and cancellation (`/v1/tasks`)
//! - Node status webhooks (`/v1/webhooks/task-status`)
//! - Node list API (`/v1/nodes`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use taskfleet_proto::{error_codes, ErrorResponse};

use crate::dispatcher::{DispatchError, Dispatcher};

mod handlers;

/// Create the HTTP router.
pub fn create_router(dispatcher: Arc<Dispatcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // API routes
        .route("/v1/tasks", post(handlers::submit_task))
        .route(
            "/v1/tasks/:id",
            get(handlers::get_task).delete(handlers::cancel_task),
        )
        .route("/v1/webhooks/task-status", post(handlers::task_status_webhook))
        .route("/v1/nodes", get(handlers::list_nodes))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(dispatcher)
}

pub(crate) fn error_response(status: StatusCode, error: &str, message: Option<String>) -> Response {
    let body = match message {
        Some(message) => ErrorResponse::with_message(error, message),
        None => ErrorResponse::new(error),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::AtCapacity { .. } => (StatusCode::SERVICE_UNAVAILABLE, error_codes::AT_CAPACITY),
            Self::NoWorkerAvailable(_) => (StatusCode::SERVICE_UNAVAILABLE, error_codes::NO_WORKER_AVAILABLE),
            Self::AlreadyExists(_) => (StatusCode::CONFLICT, error_codes::ALREADY_EXISTS),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, error_codes::UNAUTHORIZED),
            Self::Node(_) => (StatusCode::BAD_GATEWAY, "node_error"),
            Self::Invalid(_) => (StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST),
        };
        error_response(status, code, Some(self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::{json, Value};
    use taskfleet_core::{NodeId, TaskStatus, WorkerType};
    use taskfleet_proto::{SignedHeaders, TaskResponse, WebhookEvent};

    use super::*;
    use crate::config::{Config, NodeConfig};
    use crate::node_client::testing::{FakeNode, FakeNodeClient};
    use crate::scheduler::Scheduler;

    async fn serve(client: FakeNodeClient, capacity: u32) -> (SocketAddr, Arc<Dispatcher>) {
        let nodes = vec![NodeConfig {
            name: NodeId::new("main"),
            url: "http://main".to_string(),
            worker_types: vec![WorkerType::Auto, WorkerType::Opus],
            ephemeral: false,
        }];
        let client = Arc::new(client);
        let config = Arc::new(Config {
            capacity,
            dispatch_secret: "secret".to_string(),
            nodes: nodes.clone(),
            ..Config::default()
        });
        let scheduler = Scheduler::new(nodes, client.clone()).with_retry_backoff(Duration::from_millis(1));
        let dispatcher = Dispatcher::new(config, scheduler, client);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(dispatcher.clone());
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (addr, dispatcher)
    }

    async fn submit(addr: SocketAddr, id: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("http://{}/v1/tasks", addr))
            .json(&json!({ "taskId": id, "prompt": "fix the build", "workerType": "opus" }))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_get_cancel() {
        let (addr, _) = serve(FakeNodeClient::default(), 5).await;

        let resp = submit(addr, "t-1").await;
        assert_eq!(resp.status(), 202);
        let body: TaskResponse = resp.json().await.unwrap();
        assert_eq!(body.node.as_deref(), Some("main"));

        let resp = reqwest::get(format!("http://{}/v1/tasks/t-1", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = reqwest::Client::new()
            .delete(format!("http://{}/v1/tasks/t-1", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: TaskResponse = resp.json().await.unwrap();
        assert_eq!(body.status, TaskStatus::Cancelled);

        let resp = reqwest::get(format!("http://{}/v1/tasks/missing", addr)).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_submit_error_codes() {
        let client = FakeNodeClient::default().with_node(
            "main",
            FakeNode {
                available: 0,
                ..FakeNode::default()
            },
        );
        let (addr, _) = serve(client, 1).await;

        let resp = submit(addr, "t-1").await;
        assert_eq!(resp.status(), 503);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "no_worker_available");

        let resp = reqwest::Client::new()
            .post(format!("http://{}/v1/tasks", addr))
            .json(&json!({ "taskId": "../x", "prompt": "p" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_capacity_and_duplicates() {
        let (addr, _) = serve(FakeNodeClient::default(), 1).await;

        assert_eq!(submit(addr, "t-1").await.status(), 202);

        let resp = submit(addr, "t-1").await;
        assert_eq!(resp.status(), 409);

        let resp = submit(addr, "t-2").await;
        assert_eq!(resp.status(), 503);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "at_capacity");
    }

    #[tokio::test]
    async fn test_webhook_updates_status() {
        let (addr, dispatcher) = serve(FakeNodeClient::default(), 5).await;
        assert_eq!(submit(addr, "t-1").await.status(), 202);
        let secret = dispatcher
            .get(&taskfleet_core::TaskId::new("t-1"))
            .await
            .unwrap()
            .webhook_secret;

        let event = WebhookEvent {
            task_id: "t-1".to_string(),
            status: TaskStatus::Completed,
            error: None,
            action_id: None,
            timestamp_ms: 0,
        };
        let payload = event.to_value();

        let post = |headers: SignedHeaders| {
            let mut req = reqwest::Client::new()
                .post(format!("http://{}/v1/webhooks/task-status", addr))
                .json(&payload);
            for (name, value) in headers.to_pairs() {
                req = req.header(name, value);
            }
            req.send()
        };

        let resp = post(SignedHeaders::sign("wrong", &payload)).await.unwrap();
        assert_eq!(resp.status(), 401);

        let resp = post(SignedHeaders::sign(&secret, &payload)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: TaskResponse = resp.json().await.unwrap();
        assert_eq!(body.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_health_metrics_and_nodes() {
        let (addr, _) = serve(FakeNodeClient::default(), 5).await;

        let health: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let metrics = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("taskfleet_tasks_total"));

        let nodes: Value = reqwest::get(format!("http://{}/v1/nodes", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(nodes[0]["name"], "main");
        assert_eq!(nodes[0]["activeTasks"], 0);
    }
}
