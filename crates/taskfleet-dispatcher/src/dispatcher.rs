//! Task bookkeeping and admission control.

use std::sync::Arc;

use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use taskfleet_core::{CoreError, Task, TaskId, TaskStatus, WorkerType};
use taskfleet_proto::{AuthError, DispatchRequest, DispatchVerifier, SignedHeaders, TaskSubmission, WebhookEvent};

use crate::config::Config;
use crate::node_client::{NodeClient, NodeError};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::state::AppState;

/// Dispatcher errors, one per HTTP outcome.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("at capacity ({active}/{capacity} active tasks)")]
    AtCapacity { active: usize, capacity: u32 },

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("no node available for worker type {0}")]
    NoWorkerAvailable(WorkerType),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("node error: {0}")]
    Node(String),

    #[error("invalid request: {0}")]
    Invalid(#[from] CoreError),
}

impl From<AuthError> for DispatchError {
    fn from(err: AuthError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

/// Entry point for every task operation on the dispatcher.
pub struct Dispatcher {
    config: Arc<Config>,
    state: Arc<AppState>,
    scheduler: Scheduler,
    client: Arc<dyn NodeClient>,
    verifier: DispatchVerifier,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, scheduler: Scheduler, client: Arc<dyn NodeClient>) -> Arc<Self> {
        let verifier = DispatchVerifier::new(config.dispatch_secret.clone());
        Arc::new(Self {
            config,
            state: AppState::new(),
            scheduler,
            client,
            verifier,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Admit a task and hand it to a node.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<Task, DispatchError> {
        let task = submission
            .into_task()?
            .with_webhook(self.config.webhook_url(), generate_webhook_secret());
        let task_id = task.id.clone();

        {
            let mut tasks = self.state.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(DispatchError::AlreadyExists(task_id));
            }
            let active = tasks.values().filter(|t| t.status.is_active()).count();
            if active >= self.config.capacity as usize {
                warn!(task_id = %task_id, active, capacity = self.config.capacity, "Rejecting task: at capacity");
                return Err(DispatchError::AtCapacity {
                    active,
                    capacity: self.config.capacity,
                });
            }
            tasks.insert(task_id.clone(), task.clone());
        }

        let request = DispatchRequest::from_task(&task);
        let outcome = self.scheduler.dispatch(&request).await;

        let mut tasks = self.state.tasks.write().await;
        match outcome {
            Ok(node) => {
                let Some(entry) = tasks.get_mut(&task_id) else {
                    return Err(DispatchError::NotFound(task_id));
                };
                entry.node = Some(node.clone());
                let snapshot = entry.clone();
                drop(tasks);

                // Cancelled while the dispatch was in flight.
                if snapshot.status == TaskStatus::Cancelled {
                    if let Some(config) = self.scheduler.node(&node) {
                        if let Err(e) = self.client.cancel(config, &task_id).await {
                            warn!(task_id = %task_id, node = %node, error = %e, "Failed to cancel late dispatch");
                        }
                    }
                }
                Ok(snapshot)
            }
            Err(SchedulerError::NoWorkersAvailable(worker_type)) => {
                // A cancellation that landed meanwhile keeps its record.
                if tasks.get(&task_id).is_some_and(|t| t.status == TaskStatus::Pending) {
                    tasks.remove(&task_id);
                }
                info!(task_id = %task_id, worker_type = %worker_type, "No node available, task released");
                Err(DispatchError::NoWorkerAvailable(worker_type))
            }
            Err(SchedulerError::Unauthorized(node)) => {
                let message = format!("node {} rejected dispatch signature", node);
                fail_in_place(&mut tasks, &task_id, &message);
                Err(DispatchError::Unauthorized(message))
            }
            Err(SchedulerError::SendFailed { node, source }) => {
                let message = source.to_string();
                if let Some(entry) = tasks.get_mut(&task_id) {
                    entry.node = Some(node.clone());
                }
                fail_in_place(&mut tasks, &task_id, &message);
                drop(tasks);

                // The node may have accepted the task before the connection broke.
                if source.is_transient() {
                    if let Some(config) = self.scheduler.node(&node) {
                        if let Err(e) = self.client.cancel(config, &task_id).await {
                            debug!(task_id = %task_id, node = %node, error = %e, "Cleanup cancel after failed dispatch");
                        }
                    }
                }
                Err(DispatchError::Node(message))
            }
        }
    }

    /// Cancel a task on its hosting node.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task, DispatchError> {
        let task = self.get(task_id).await?;
        if task.is_terminal() {
            return Ok(task);
        }

        if let Some(node) = task.node.as_ref().and_then(|n| self.scheduler.node(n)) {
            match self.client.cancel(node, task_id).await {
                Ok(_) | Err(NodeError::NotFound) => {}
                Err(e) => {
                    warn!(task_id = %task_id, node = %node.name, error = %e, "Cancellation failed");
                    return Err(DispatchError::Node(e.to_string()));
                }
            }
        }

        let mut tasks = self.state.tasks.write().await;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.clone()))?;
        // A webhook may have finished the task meanwhile.
        if !entry.is_terminal() {
            entry.transition(TaskStatus::Cancelled)?;
            info!(task_id = %task_id, "Task cancelled");
        }
        Ok(entry.clone())
    }

    /// Last known state of a task.
    pub async fn get(&self, task_id: &TaskId) -> Result<Task, DispatchError> {
        self.state
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(task_id.clone()))
    }

    /// Apply a signed status webhook from a node.
    pub async fn record_status(&self, headers: &SignedHeaders, payload: &Value) -> Result<Task, DispatchError> {
        let event: WebhookEvent = serde_json::from_value(payload.clone())
            .map_err(|e| CoreError::InvalidInput(format!("invalid webhook body: {}", e)))?;
        let task_id = TaskId::parse(event.task_id.clone())?;

        let secret = self.get(&task_id).await?.webhook_secret;
        self.verifier.verify_with_secret(&secret, headers, payload)?;

        let mut tasks = self.state.tasks.write().await;
        let entry = tasks
            .get_mut(&task_id)
            .ok_or_else(|| DispatchError::NotFound(task_id.clone()))?;
        apply_status(entry, event.status, event.error);
        Ok(entry.clone())
    }

    /// Poll the hosting node of every active task once.
    pub async fn reconcile_once(&self) -> usize {
        let active: Vec<Task> = self
            .state
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_active() && t.node.is_some())
            .cloned()
            .collect();

        let mut updated = 0;
        for task in active {
            let Some(node) = task.node.as_ref().and_then(|n| self.scheduler.node(n)) else {
                continue;
            };

            let (status, error) = match self.client.get_task(node, &task.id).await {
                Ok(resp) => (resp.status, resp.error),
                Err(NodeError::NotFound) => (TaskStatus::Failed, Some("task lost by node".to_string())),
                Err(e) => {
                    debug!(task_id = %task.id, node = %node.name, error = %e, "Reconcile poll failed");
                    continue;
                }
            };

            let mut tasks = self.state.tasks.write().await;
            if let Some(entry) = tasks.get_mut(&task.id) {
                if apply_status(entry, status, error) {
                    updated += 1;
                }
            }
        }
        updated
    }
}

/// Move `task` to `status` when the state machine allows it.
fn apply_status(task: &mut Task, status: TaskStatus, error: Option<String>) -> bool {
    if task.status == status || !task.status.can_transition_to(status) {
        return false;
    }
    if task.transition(status).is_err() {
        return false;
    }
    if status == TaskStatus::Failed {
        task.error_message = error.or_else(|| Some("task failed".to_string()));
    }
    info!(task_id = %task.id, status = %status, "Task status updated");
    true
}

fn fail_in_place(tasks: &mut std::collections::HashMap<TaskId, Task>, task_id: &TaskId, message: &str) {
    if let Some(entry) = tasks.get_mut(task_id) {
        if entry.fail(message).is_ok() {
            warn!(task_id = %task_id, error = %message, "Task failed during dispatch");
        }
    }
}

/// 32 random bytes, hex-encoded.
fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskfleet_core::NodeId;

    use super::*;
    use crate::config::NodeConfig;
    use crate::node_client::testing::{FakeNode, FakeNodeClient};

    fn harness(client: FakeNodeClient, capacity: u32) -> (Arc<Dispatcher>, Arc<FakeNodeClient>) {
        let nodes = vec![NodeConfig {
            name: NodeId::new("main"),
            url: "http://main".to_string(),
            worker_types: vec![WorkerType::Opus, WorkerType::Auto],
            ephemeral: false,
        }];
        let config = Arc::new(Config {
            capacity,
            dispatch_secret: "secret".to_string(),
            public_url: "http://dispatcher".to_string(),
            nodes: nodes.clone(),
            ..Config::default()
        });
        let client = Arc::new(client);
        let scheduler = Scheduler::new(nodes, client.clone()).with_retry_backoff(Duration::from_millis(1));
        (Dispatcher::new(config, scheduler, client.clone()), client)
    }

    fn submission(id: &str) -> TaskSubmission {
        serde_json::from_value(serde_json::json!({ "taskId": id, "prompt": "fix it" })).unwrap()
    }

    async fn finish(dispatcher: &Dispatcher, id: &str, status: TaskStatus) {
        let task = dispatcher.get(&TaskId::new(id)).await.unwrap();
        let event = WebhookEvent {
            task_id: id.to_string(),
            status,
            error: None,
            action_id: None,
            timestamp_ms: 0,
        };
        let payload = event.to_value();
        let headers = SignedHeaders::sign(&task.webhook_secret, &payload);
        dispatcher.record_status(&headers, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_assigns_node_and_webhook() {
        let (dispatcher, client) = harness(FakeNodeClient::default(), 5);
        let task = dispatcher.submit(submission("t-1")).await.unwrap();

        assert_eq!(task.node.as_ref().map(|n| n.as_str()), Some("main"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.webhook_url, "http://dispatcher/v1/webhooks/task-status");
        assert_eq!(task.webhook_secret.len(), 64);
        assert_eq!(client.dispatches().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_and_release() {
        let (dispatcher, _) = harness(FakeNodeClient::default(), 5);
        for i in 0..5 {
            dispatcher.submit(submission(&format!("t-{}", i))).await.unwrap();
        }

        let err = dispatcher.submit(submission("t-5")).await.unwrap_err();
        assert!(matches!(err, DispatchError::AtCapacity { active: 5, capacity: 5 }));
        assert!(dispatcher.get(&TaskId::new("t-5")).await.is_err());

        finish(&dispatcher, "t-0", TaskStatus::Completed).await;
        assert!(dispatcher.submit(submission("t-5")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (dispatcher, _) = harness(FakeNodeClient::default(), 5);
        dispatcher.submit(submission("t-1")).await.unwrap();
        let err = dispatcher.submit(submission("t-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_no_worker_releases_task() {
        let client = FakeNodeClient::default().with_node(
            "main",
            FakeNode {
                available: 0,
                ..FakeNode::default()
            },
        );
        let (dispatcher, _) = harness(client, 5);

        let err = dispatcher.submit(submission("t-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoWorkerAvailable(WorkerType::Auto)));
        assert!(matches!(
            dispatcher.get(&TaskId::new("t-1")).await,
            Err(DispatchError::NotFound(_))
        ));
        assert_eq!(dispatcher.state().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_marks_task_failed() {
        let down = || Err(NodeError::Transport("connection reset".to_string()));
        let client = FakeNodeClient::default().with_node(
            "main",
            FakeNode {
                dispatch_script: vec![down(), down(), down()],
                ..FakeNode::default()
            },
        );
        let (dispatcher, client) = harness(client, 5);

        let err = dispatcher.submit(submission("t-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Node(_)));

        let task = dispatcher.get(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.node.as_ref().map(|n| n.as_str()), Some("main"));
        assert!(task.error_message.unwrap().contains("connection reset"));
        assert_eq!(
            client.cancels.lock().unwrap().clone(),
            vec![("main".to_string(), "t-1".to_string())]
        );
    }

    /// Holds every health check until the test opens the gate.
    struct GatedClient {
        inner: FakeNodeClient,
        entered: tokio::sync::Notify,
        gate: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl NodeClient for GatedClient {
        async fn health(&self, node: &NodeConfig) -> Result<taskfleet_proto::HealthResponse, NodeError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.health(node).await
        }

        async fn dispatch(
            &self,
            node: &NodeConfig,
            request: &DispatchRequest,
        ) -> Result<taskfleet_proto::TaskAccepted, NodeError> {
            self.inner.dispatch(node, request).await
        }

        async fn cancel(&self, node: &NodeConfig, task_id: &TaskId) -> Result<taskfleet_proto::TaskResponse, NodeError> {
            self.inner.cancel(node, task_id).await
        }

        async fn get_task(&self, node: &NodeConfig, task_id: &TaskId) -> Result<taskfleet_proto::TaskResponse, NodeError> {
            self.inner.get_task(node, task_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch_survives_no_worker() {
        let nodes = vec![NodeConfig {
            name: NodeId::new("main"),
            url: "http://main".to_string(),
            worker_types: vec![WorkerType::Auto],
            ephemeral: false,
        }];
        let client = Arc::new(GatedClient {
            inner: FakeNodeClient::default().with_node(
                "main",
                FakeNode {
                    available: 0,
                    ..FakeNode::default()
                },
            ),
            entered: tokio::sync::Notify::new(),
            gate: tokio::sync::Notify::new(),
        });
        let config = Arc::new(Config {
            dispatch_secret: "secret".to_string(),
            nodes: nodes.clone(),
            ..Config::default()
        });
        let dispatcher = Dispatcher::new(config, Scheduler::new(nodes, client.clone()), client.clone());
        let id = TaskId::new("t-1");

        let submitting = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(submission("t-1")).await })
        };
        client.entered.notified().await;

        let cancelled = dispatcher.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        client.gate.notify_one();

        let err = submitting.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::NoWorkerAvailable(WorkerType::Auto)));
        assert_eq!(dispatcher.get(&id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (dispatcher, client) = harness(FakeNodeClient::default(), 5);
        dispatcher.submit(submission("t-1")).await.unwrap();

        let task = dispatcher.cancel(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(client.cancels.lock().unwrap().len(), 1);

        // Terminal: unchanged, no second node call.
        let again = dispatcher.cancel(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(again.status, TaskStatus::Cancelled);
        assert_eq!(client.cancels.lock().unwrap().len(), 1);

        assert!(matches!(
            dispatcher.cancel(&TaskId::new("nope")).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_signature_and_terminal_states() {
        let (dispatcher, _) = harness(FakeNodeClient::default(), 5);
        dispatcher.submit(submission("t-1")).await.unwrap();

        let event = WebhookEvent {
            task_id: "t-1".to_string(),
            status: TaskStatus::Running,
            error: None,
            action_id: None,
            timestamp_ms: 0,
        };
        let payload = event.to_value();

        let forged = SignedHeaders::sign("secret", &payload);
        assert!(matches!(
            dispatcher.record_status(&forged, &payload).await,
            Err(DispatchError::Unauthorized(_))
        ));

        finish(&dispatcher, "t-1", TaskStatus::Running).await;
        finish(&dispatcher, "t-1", TaskStatus::Failed).await;
        finish(&dispatcher, "t-1", TaskStatus::Completed).await;

        let task = dispatcher.get(&TaskId::new("t-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("task failed"));
    }

    #[tokio::test]
    async fn test_reconcile_applies_node_state() {
        let (dispatcher, client) = harness(FakeNodeClient::default(), 5);
        dispatcher.submit(submission("t-1")).await.unwrap();
        dispatcher.submit(submission("t-2")).await.unwrap();

        assert_eq!(dispatcher.reconcile_once().await, 2);
        assert_eq!(dispatcher.get(&TaskId::new("t-1")).await.unwrap().status, TaskStatus::Running);

        client.set_task_status("main", None);
        assert_eq!(dispatcher.reconcile_once().await, 2);
        let lost = dispatcher.get(&TaskId::new("t-2")).await.unwrap();
        assert_eq!(lost.status, TaskStatus::Failed);
        assert_eq!(lost.error_message.as_deref(), Some("task lost by node"));
        assert_eq!(dispatcher.state().active_count().await, 0);
    }
}
