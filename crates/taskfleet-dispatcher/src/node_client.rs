//! Calls from the dispatcher to worker nodes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use taskfleet_core::TaskId;
use taskfleet_proto::{cancel_payload, DispatchRequest, HealthResponse, SignedHeaders, TaskAccepted, TaskResponse};

use crate::config::NodeConfig;

/// Errors from a node call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The node is full (503).
    #[error("node at capacity")]
    AtCapacity,

    /// The node rejected our signature (401).
    #[error("node rejected request signature")]
    Unauthorized,

    /// The node does not know the task (404).
    #[error("task not found on node")]
    NotFound,

    /// Connection failure or timeout. Worth retrying.
    #[error("node unreachable: {0}")]
    Transport(String),

    /// Any other non-success response.
    #[error("node returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl NodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_)) || matches!(self, Self::Status { status, .. } if *status >= 500)
    }
}

/// Node API as used by the dispatcher.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `GET /health`.
    async fn health(&self, node: &NodeConfig) -> Result<HealthResponse, NodeError>;

    /// Signed `POST /tasks`. Every call signs with a fresh nonce.
    async fn dispatch(&self, node: &NodeConfig, request: &DispatchRequest) -> Result<TaskAccepted, NodeError>;

    /// Signed `DELETE /tasks/:id`.
    async fn cancel(&self, node: &NodeConfig, task_id: &TaskId) -> Result<TaskResponse, NodeError>;

    /// `GET /tasks/:id`.
    async fn get_task(&self, node: &NodeConfig, task_id: &TaskId) -> Result<TaskResponse, NodeError>;
}

/// [`NodeClient`] over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    client: reqwest::Client,
    secret: String,
}

impl HttpNodeClient {
    pub fn new(secret: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            secret: secret.into(),
        })
    }

    fn url(node: &NodeConfig, path: &str) -> String {
        format!("{}{}", node.url.trim_end_matches('/'), path)
    }

    fn signed(&self, mut request: reqwest::RequestBuilder, payload: &Value) -> reqwest::RequestBuilder {
        for (name, value) in SignedHeaders::sign(&self.secret, payload).to_pairs() {
            request = request.header(name, value);
        }
        request
    }

    async fn send<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, NodeError> {
        let response = request
            .send()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| NodeError::Status {
                    status: status.as_u16(),
                    body: format!("invalid response body: {}", e),
                }),
            StatusCode::SERVICE_UNAVAILABLE => Err(NodeError::AtCapacity),
            StatusCode::UNAUTHORIZED => Err(NodeError::Unauthorized),
            StatusCode::NOT_FOUND => Err(NodeError::NotFound),
            status => Err(NodeError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn health(&self, node: &NodeConfig) -> Result<HealthResponse, NodeError> {
        Self::send(self.client.get(Self::url(node, "/health"))).await
    }

    async fn dispatch(&self, node: &NodeConfig, request: &DispatchRequest) -> Result<TaskAccepted, NodeError> {
        let payload = request.to_value();
        debug!(node = %node.name, task_id = %request.task_id, "Dispatching task");
        let builder = self.client.post(Self::url(node, "/tasks")).json(&payload);
        Self::send(self.signed(builder, &payload)).await
    }

    async fn cancel(&self, node: &NodeConfig, task_id: &TaskId) -> Result<TaskResponse, NodeError> {
        let payload = cancel_payload(task_id);
        let builder = self.client.delete(Self::url(node, &format!("/tasks/{}", task_id)));
        Self::send(self.signed(builder, &payload)).await
    }

    async fn get_task(&self, node: &NodeConfig, task_id: &TaskId) -> Result<TaskResponse, NodeError> {
        Self::send(self.client.get(Self::url(node, &format!("/tasks/{}", task_id)))).await
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use taskfleet_core::{NodeId, Task, TaskStatus, WorkerType};
    use taskfleet_proto::DispatchVerifier;

    use super::*;

    async fn accept(
        State(verifier): State<Arc<DispatchVerifier>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Result<Json<TaskAccepted>, AxumStatus> {
        let signed = SignedHeaders::from_lookup(|n| headers.get(n).and_then(|v| v.to_str().ok()))
            .map_err(|_| AxumStatus::UNAUTHORIZED)?;
        verifier.verify(&signed, &body).map_err(|_| AxumStatus::UNAUTHORIZED)?;
        Ok(Json(TaskAccepted {
            task_id: body["taskId"].as_str().unwrap_or_default().to_string(),
            status: TaskStatus::Pending,
            duplicate: false,
        }))
    }

    async fn full() -> AxumStatus {
        AxumStatus::SERVICE_UNAVAILABLE
    }

    async fn node(router: Router) -> NodeConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        NodeConfig {
            name: NodeId::new("n1"),
            url: format!("http://{}", addr),
            worker_types: vec![WorkerType::Auto],
            ephemeral: false,
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest::from_task(&Task::new(TaskId::new("t-1"), WorkerType::Auto, "go").with_webhook("http://d/hook", "whs"))
    }

    #[tokio::test]
    async fn test_dispatch_is_signed() {
        let router = Router::new()
            .route("/tasks", post(accept))
            .with_state(Arc::new(DispatchVerifier::new("secret")));
        let node = node(router).await;

        let good = HttpNodeClient::new("secret", Duration::from_secs(5)).unwrap();
        let accepted = good.dispatch(&node, &request()).await.unwrap();
        assert_eq!(accepted.task_id, "t-1");

        // Second attempt with the same body is not a replay: fresh nonce.
        assert!(good.dispatch(&node, &request()).await.is_ok());

        let bad = HttpNodeClient::new("other", Duration::from_secs(5)).unwrap();
        assert_eq!(bad.dispatch(&node, &request()).await.unwrap_err(), NodeError::Unauthorized);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let router = Router::new()
            .route("/tasks", post(full))
            .route("/tasks/:id", delete(|| async { AxumStatus::NOT_FOUND }));
        let node = node(router).await;
        let client = HttpNodeClient::new("secret", Duration::from_secs(5)).unwrap();

        assert_eq!(client.dispatch(&node, &request()).await.unwrap_err(), NodeError::AtCapacity);
        assert_eq!(
            client.cancel(&node, &TaskId::new("t-1")).await.unwrap_err(),
            NodeError::NotFound
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transient() {
        let node = NodeConfig {
            name: NodeId::new("gone"),
            url: "http://127.0.0.1:1".to_string(),
            worker_types: vec![WorkerType::Auto],
            ephemeral: false,
        };
        let client = HttpNodeClient::new("secret", Duration::from_secs(2)).unwrap();
        let err = client.health(&node).await.unwrap_err();
        assert!(err.is_transient());
    }
}
