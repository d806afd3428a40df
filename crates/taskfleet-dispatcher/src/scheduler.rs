//! Task scheduler - routes tasks to worker nodes.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use taskfleet_core::{NodeId, WorkerType};
use taskfleet_proto::DispatchRequest;

use crate::config::NodeConfig;
use crate::node_client::{NodeClient, NodeError};

/// Attempts per node for transport failures.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No node available for worker type: {0}")]
    NoWorkersAvailable(WorkerType),

    #[error("Node {0} rejected the dispatch signature")]
    Unauthorized(NodeId),

    /// The node may or may not hold the task; it is never offered elsewhere.
    #[error("Failed to send task to node {node}: {source}")]
    SendFailed {
        node: NodeId,
        #[source]
        source: NodeError,
    },
}

/// Task scheduler.
pub struct Scheduler {
    nodes: Vec<NodeConfig>,
    client: Arc<dyn NodeClient>,
    retry_backoff: Duration,
}

impl Scheduler {
    /// Create a new Scheduler over the configured node table.
    pub fn new(nodes: Vec<NodeConfig>, client: Arc<dyn NodeClient>) -> Self {
        Self {
            nodes,
            client,
            retry_backoff: Duration::from_millis(200),
        }
    }

    /// Set the base backoff between transport retries.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    /// Look up a configured node by name.
    pub fn node(&self, name: &NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| &n.name == name)
    }

    /// Nodes able to run `worker_type`, always-on first, each group in
    /// configured order.
    pub fn candidates(&self, worker_type: WorkerType) -> Vec<&NodeConfig> {
        let supporting = self.nodes.iter().filter(|n| n.supports(worker_type));
        let (always_on, ephemeral): (Vec<_>, Vec<_>) = supporting.partition(|n| !n.ephemeral);
        always_on.into_iter().chain(ephemeral).collect()
    }

    /// Send `request` to the first available candidate node.
    ///
    /// Returns the node that accepted the task. Only a definite refusal
    /// (503 at capacity) moves on to the next candidate; any other failure
    /// may have left the task running on the node and ends the dispatch.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<NodeId, SchedulerError> {
        for node in self.candidates(request.worker_type) {
            match self.client.health(node).await {
                Ok(health) if health.available > 0 => {}
                Ok(_) => {
                    debug!(node = %node.name, "Node has no free slots");
                    continue;
                }
                Err(e) => {
                    debug!(node = %node.name, error = %e, "Node health check failed");
                    continue;
                }
            }

            match self.send(node, request).await {
                Ok(()) => {
                    info!(
                        task_id = %request.task_id,
                        node = %node.name,
                        worker_type = %request.worker_type,
                        "Task dispatched"
                    );
                    return Ok(node.name.clone());
                }
                Err(NodeError::AtCapacity) => {
                    debug!(node = %node.name, "Node at capacity, trying next");
                }
                Err(NodeError::Unauthorized) => {
                    warn!(node = %node.name, "Node rejected dispatch signature");
                    return Err(SchedulerError::Unauthorized(node.name.clone()));
                }
                Err(e) => {
                    warn!(node = %node.name, task_id = %request.task_id, error = %e, "Dispatch failed");
                    return Err(SchedulerError::SendFailed {
                        node: node.name.clone(),
                        source: e,
                    });
                }
            }
        }

        Err(SchedulerError::NoWorkersAvailable(request.worker_type))
    }

    /// One node, up to [`MAX_SEND_ATTEMPTS`] tries on transient errors.
    async fn send(&self, node: &NodeConfig, request: &DispatchRequest) -> Result<(), NodeError> {
        let mut attempt = 1;
        loop {
            match self.client.dispatch(node, request).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < MAX_SEND_ATTEMPTS => {
                    let backoff = self.retry_backoff * 2u32.pow(attempt - 1);
                    debug!(node = %node.name, attempt, error = %e, "Retrying dispatch in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
