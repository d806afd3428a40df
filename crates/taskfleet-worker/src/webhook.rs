//! Task status notifications back to the submitter.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use taskfleet_core::Task;
use taskfleet_proto::{SignedHeaders, WebhookEvent};

/// Delivers status changes for a task. Failures never affect the task.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, task: &Task);
}

/// POSTs a signed [`WebhookEvent`] to the task's webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    max_attempts: u32,
    backoff: Duration,
}

impl WebhookNotifier {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        })
    }

    async fn deliver(&self, url: &str, secret: &str, event: &WebhookEvent) -> Result<(), String> {
        let body = event.to_value();
        // Fresh nonce per attempt.
        let headers = SignedHeaders::sign(secret, &body);

        let mut request = self.client.post(url).json(&body);
        for (name, value) in headers.to_pairs() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }
}

#[async_trait]
impl StatusNotifier for WebhookNotifier {
    async fn notify(&self, task: &Task) {
        if task.webhook_url.is_empty() {
            return;
        }

        let event = WebhookEvent::for_task(task);
        let mut backoff = self.backoff;

        for attempt in 1..=self.max_attempts {
            match self.deliver(&task.webhook_url, &task.webhook_secret, &event).await {
                Ok(()) => {
                    debug!(task_id = %task.id, status = %task.status, "Webhook delivered");
                    return;
                }
                Err(e) => {
                    warn!(task_id = %task.id, attempt, error = %e, "Webhook delivery failed");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        warn!(task_id = %task.id, status = %task.status, "Giving up on webhook");
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use taskfleet_core::TaskStatus;

    use super::*;

    /// Records every notification.
    #[derive(Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<(String, TaskStatus)>>,
    }

    impl RecordingNotifier {
        pub fn events(&self) -> Vec<(String, TaskStatus)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusNotifier for RecordingNotifier {
        async fn notify(&self, task: &Task) {
            self.events
                .lock()
                .unwrap()
                .push((task.id.to_string(), task.status));
        }
    }
}
