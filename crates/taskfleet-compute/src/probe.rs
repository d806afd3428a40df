//! Health probing of the worker orchestrator on the instance.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use taskfleet_core::HealthStatus;
use taskfleet_proto::HealthResponse;

/// One observation of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub health: HealthStatus,
    /// Running task count, known only when the orchestrator is ready.
    pub running_tasks: Option<u32>,
}

impl ProbeResult {
    pub fn ready(running_tasks: u32) -> Self {
        Self {
            health: HealthStatus::Ready,
            running_tasks: Some(running_tasks),
        }
    }

    pub fn not_ready() -> Self {
        Self {
            health: HealthStatus::NotReady,
            running_tasks: None,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            health: HealthStatus::Unreachable,
            running_tasks: None,
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

/// Calls the orchestrator's `GET /health`.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> ProbeResult {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Health probe failed");
                return ProbeResult::unreachable();
            }
        };

        if !response.status().is_success() {
            return ProbeResult::not_ready();
        }

        match response.json::<HealthResponse>().await {
            Ok(health) if health.status == "ok" => ProbeResult::ready(health.running),
            Ok(_) | Err(_) => ProbeResult::not_ready(),
        }
    }
}


#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_ready_with_running_count() {
        let url = serve(Router::new().route(
            "/health",
            get(|| async {
                Json(HealthResponse {
                    status: "ok".to_string(),
                    capacity: 5,
                    running: 2,
                    available: 3,
                })
            }),
        ))
        .await;

        let probe = HttpHealthProbe::new(&url, Duration::from_secs(2)).unwrap();
        assert_eq!(probe.probe().await, ProbeResult::ready(2));
    }

    #[tokio::test]
    async fn test_error_status_is_not_ready() {
        let url = serve(Router::new().route("/health", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))).await;
        let probe = HttpHealthProbe::new(&url, Duration::from_secs(2)).unwrap();
        assert_eq!(probe.probe().await.health, HealthStatus::NotReady);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let probe = HttpHealthProbe::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        assert_eq!(probe.probe().await, ProbeResult::unreachable());
    }
}
