//! HTTP server for the worker node.
//!
//! Provides endpoints for:
//! - Signed task dispatch and cancellation (`/tasks`)
//! - Task status (`/tasks/:id`)
//! - Health check (`/health`)
//! - Agent credential refresh (`/admin/refresh-token`)

use std::sync::Arc;

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::warn;

use taskfleet_proto::{error_codes, ErrorResponse, SignedHeaders};

use crate::state::AppState;

mod handlers;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(handlers::dispatch_task))
        .route(
            "/tasks/:id",
            get(handlers::get_task).delete(handlers::cancel_task),
        )
        .route("/health", get(handlers::health_check))
        .route("/admin/refresh-token", post(handlers::refresh_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn error_response(status: StatusCode, error: &str, message: Option<String>) -> Response {
    let body = match message {
        Some(message) => ErrorResponse::with_message(error, message),
        None => ErrorResponse::new(error),
    };
    (status, Json(body)).into_response()
}

/// Check the dispatch envelope headers against `payload`.
pub(crate) fn verify_signed(state: &AppState, headers: &HeaderMap, payload: &Value) -> Result<(), Response> {
    let signed = SignedHeaders::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok()))
        .and_then(|signed| state.verifier.verify(&signed, payload).map(|_| signed));

    match signed {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "Rejected signed request");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                error_codes::UNAUTHORIZED,
                Some(e.to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::json;
    use taskfleet_core::{Task, TaskId, WorkerType};
    use taskfleet_proto::{cancel_payload, DispatchRequest, DispatchVerifier};

    use super::*;
    use crate::command::testing::FakeRunner;
    use crate::command::{CommandOutput, CommandRunner};
    use crate::config::Config;
    use crate::log_forwarder::{ForwarderConfig, LogForwarder};
    use crate::log_store::testing::MemoryLogStore;
    use crate::orchestrator::Orchestrator;
    use crate::session::SessionManager;
    use crate::webhook::testing::RecordingNotifier;
    use crate::workspace::WorkspaceManager;

    const SECRET: &str = "dispatch-secret";

    async fn serve(capacity: u32) -> (SocketAddr, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeRunner::new(|spec| {
            match (spec.program.as_str(), spec.args[0].as_str()) {
                ("tmux", "list-panes") => Ok(CommandOutput::ok("0 \n")),
                ("tmux", "has-session") => Ok(CommandOutput::failed(1, "can't find session")),
                _ => Ok(CommandOutput::ok("")),
            }
        }));
        let config = Config {
            capacity,
            worktrees_root: tmp.path().join("w"),
            log_dir: tmp.path().join("l"),
            completion_poll_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(config.clone()),
            Arc::new(WorkspaceManager::new(runner.clone(), &config.worktrees_root, config.install_timeout)),
            Arc::new(SessionManager::new(runner, &config.log_dir, "node")),
            Arc::new(LogForwarder::new(Arc::new(MemoryLogStore::new()), ForwarderConfig::default())),
            Arc::new(RecordingNotifier::default()),
        );
        let state = AppState::new(
            orchestrator,
            DispatchVerifier::new(SECRET),
            Some("admin".to_string()),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, create_router(state)).await.unwrap() });
        (addr, tmp)
    }

    fn body(id: &str) -> Value {
        let task = Task::new(TaskId::new(id), WorkerType::Glm, "Refactor the parser")
            .with_webhook("", "whs");
        DispatchRequest::from_task(&task).to_value()
    }

    async fn dispatch(addr: SocketAddr, body: &Value, secret: &str) -> reqwest::Response {
        let headers = SignedHeaders::sign(secret, body);
        let mut req = reqwest::Client::new()
            .post(format!("http://{}/tasks", addr))
            .json(body);
        for (name, value) in headers.to_pairs() {
            req = req.header(name, value);
        }
        req.send().await.unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_then_get() {
        let (addr, _tmp) = serve(5).await;

        let resp = dispatch(addr, &body("t-1"), SECRET).await;
        assert_eq!(resp.status(), 202);
        let accepted: Value = resp.json().await.unwrap();
        assert_eq!(accepted["taskId"], "t-1");
        assert_eq!(accepted["duplicate"], false);

        let resp = reqwest::get(format!("http://{}/tasks/t-1", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let task: Value = resp.json().await.unwrap();
        assert_eq!(task["workerType"], "glm");

        let resp = reqwest::get(format!("http://{}/tasks/nope", addr)).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_bad_signature_and_replay_rejected() {
        let (addr, _tmp) = serve(5).await;

        let resp = dispatch(addr, &body("t-1"), "wrong").await;
        assert_eq!(resp.status(), 401);

        let payload = body("t-2");
        let headers = SignedHeaders::sign(SECRET, &payload);
        for expected in [202, 401] {
            let mut req = reqwest::Client::new()
                .post(format!("http://{}/tasks", addr))
                .json(&payload);
            for (name, value) in headers.to_pairs() {
                req = req.header(name, value);
            }
            assert_eq!(req.send().await.unwrap().status(), expected);
        }

        let unsigned = reqwest::Client::new()
            .post(format!("http://{}/tasks", addr))
            .json(&body("t-3"))
            .send()
            .await
            .unwrap();
        assert_eq!(unsigned.status(), 401);
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        let (addr, _tmp) = serve(5).await;
        let payload = json!({ "taskId": "../etc", "workerType": "auto", "prompt": "x", "webhookUrl": "", "webhookSecret": "" });
        let resp = dispatch(addr, &payload, SECRET).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_at_capacity_is_503() {
        let (addr, _tmp) = serve(1).await;
        assert_eq!(dispatch(addr, &body("a"), SECRET).await.status(), 202);

        let resp = dispatch(addr, &body("b"), SECRET).await;
        assert_eq!(resp.status(), 503);
        let err: Value = resp.json().await.unwrap();
        assert_eq!(err["error"], "at_capacity");

        let health: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["available"], 0);
        assert_eq!(health["capacity"], 1);
    }

    #[tokio::test]
    async fn test_signed_cancel() {
        let (addr, _tmp) = serve(5).await;
        dispatch(addr, &body("t-1"), SECRET).await;

        let client = reqwest::Client::new();
        let payload = cancel_payload(&TaskId::new("t-1"));

        let forged = SignedHeaders::sign("wrong", &payload);
        let mut req = client.delete(format!("http://{}/tasks/t-1", addr));
        for (name, value) in forged.to_pairs() {
            req = req.header(name, value);
        }
        assert_eq!(req.send().await.unwrap().status(), 401);

        let signed = SignedHeaders::sign(SECRET, &payload);
        let mut req = client.delete(format!("http://{}/tasks/t-1", addr));
        for (name, value) in signed.to_pairs() {
            req = req.header(name, value);
        }
        let resp = req.send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let task: Value = resp.json().await.unwrap();
        assert_eq!(task["status"], "cancelled");

        let ghost = cancel_payload(&TaskId::new("ghost"));
        let signed = SignedHeaders::sign(SECRET, &ghost);
        let mut req = client.delete(format!("http://{}/tasks/ghost", addr));
        for (name, value) in signed.to_pairs() {
            req = req.header(name, value);
        }
        assert_eq!(req.send().await.unwrap().status(), 404);
    }

    #[tokio::test]
    async fn test_refresh_token_requires_bearer() {
        let (addr, _tmp) = serve(5).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/admin/refresh-token", addr);

        let resp = client
            .post(&url)
            .json(&json!({ "token": "new" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        for wrong in ["nope", "admin2", "admi"] {
            let resp = client
                .post(&url)
                .bearer_auth(wrong)
                .json(&json!({ "token": "new" }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 401);
        }

        let resp = client
            .post(&url)
            .bearer_auth("admin")
            .json(&json!({ "token": "new" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
}
