//! HTTP server for the compute manager.
//!
//! Provides endpoints for:
//! - Instance control (`/start`, `/stop`, `/status`), bearer-token gated
//! - Health check (`/health`)

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use taskfleet_proto::ErrorResponse;

use crate::state::AppState;

mod handlers;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", post(handlers::start))
        .route("/stop", post(handlers::stop))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health_check))
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

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::Value;
    use taskfleet_core::InstanceState;
    use taskfleet_proto::{ComputeStatusResponse, StartResponse, StopResponse};

    use super::*;
    use crate::lifecycle::{LifecycleConfig, LifecycleManager};
    use crate::probe::testing::FakeProbe;
    use crate::probe::ProbeResult;
    use crate::provider::testing::{FakeProvider, ProviderCall};

    async fn serve(states: Vec<InstanceState>, probe: ProbeResult) -> (SocketAddr, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new(states));
        let config = LifecycleConfig {
            status_poll_interval: Duration::from_millis(10),
            health_poll_interval: Duration::from_millis(10),
            ..LifecycleConfig::default()
        };
        let lifecycle = LifecycleManager::new(provider.clone(), Arc::new(FakeProbe::new([probe])), config);
        let router = create_router(AppState::new(lifecycle, "ops-token"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (addr, provider)
    }

    fn post(addr: SocketAddr, path: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        let req = reqwest::Client::new().post(format!("http://{}{}", addr, path));
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    #[tokio::test]
    async fn test_control_requires_bearer_token() {
        let (addr, provider) = serve(vec![InstanceState::Terminated], ProbeResult::ready(0)).await;

        let resp = post(addr, "/start", None).send().await.unwrap();
        assert_eq!(resp.status(), 401);
        let resp = post(addr, "/stop", Some("wrong")).send().await.unwrap();
        assert_eq!(resp.status(), 401);
        let resp = reqwest::get(format!("http://{}/status", addr)).await.unwrap();
        assert_eq!(resp.status(), 401);
        assert!(provider.calls().is_empty());

        let health: Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (addr, provider) = serve(
            vec![InstanceState::Terminated, InstanceState::Running],
            ProbeResult::ready(0),
        )
        .await;

        let resp: StartResponse = post(addr, "/start", Some("ops-token"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(resp.success, "{}", resp.message);
        assert!(resp.startup_duration_ms.is_some());
        assert_eq!(provider.count(ProviderCall::Start), 1);

        // Freshly idle: the grace period has not elapsed.
        let resp: StopResponse = post(addr, "/stop", Some("ops-token"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(provider.count(ProviderCall::Stop), 0);

        let status: ComputeStatusResponse = reqwest::Client::new()
            .get(format!("http://{}/status", addr))
            .bearer_auth("ops-token")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.instance_state, InstanceState::Running);
        assert_eq!(status.running_tasks, Some(0));
    }
}
