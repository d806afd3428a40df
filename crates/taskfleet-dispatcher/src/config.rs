//! Dispatcher configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskfleet_core::{NodeId, WorkerType};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read node table {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid node table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid node table: {0}")]
    Invalid(String),
}

/// One worker node the dispatcher may send tasks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Unique node name.
    pub name: NodeId,

    /// Base URL of the node's HTTP API, e.g. `http://10.0.0.5:8080`.
    pub url: String,

    /// Worker classes the node runs.
    pub worker_types: Vec<WorkerType>,

    /// Ephemeral nodes are only used when no always-on node is available.
    #[serde(default)]
    pub ephemeral: bool,
}

impl NodeConfig {
    pub fn supports(&self, worker_type: WorkerType) -> bool {
        self.worker_types.contains(&worker_type)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub bind_addr: String,

    /// Maximum concurrently active tasks across the fleet.
    pub capacity: u32,

    /// Shared secret for signed dispatch and cancel requests.
    pub dispatch_secret: String,

    /// Externally reachable base URL of this dispatcher; node webhooks go to
    /// `<public_url>/v1/webhooks/task-status`.
    pub public_url: String,

    /// Worker nodes in preference order.
    pub nodes: Vec<NodeConfig>,

    /// How often active tasks are reconciled against their nodes.
    pub reconcile_interval: Duration,

    /// Timeout for a single request to a node.
    pub request_timeout: Duration,

    /// How long finished tasks stay queryable before they are evicted.
    pub task_retention: Duration,
}

impl Config {
    /// Where nodes report status changes.
    pub fn webhook_url(&self) -> String {
        format!("{}/v1/webhooks/task-status", self.public_url.trim_end_matches('/'))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8090".to_string(),
            capacity: 5,
            dispatch_secret: String::new(),
            public_url: "http://localhost:8090".to_string(),
            nodes: Vec::new(),
            reconcile_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            task_retention: Duration::from_secs(3600),
        }
    }
}

/// Parse a JSON node table.
pub fn parse_nodes(json: &str) -> Result<Vec<NodeConfig>, ConfigError> {
    let nodes: Vec<NodeConfig> = serde_json::from_str(json)?;

    let mut seen = std::collections::HashSet::new();
    for node in &nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate node name '{}'", node.name)));
        }
        if node.worker_types.is_empty() {
            return Err(ConfigError::Invalid(format!("node '{}' has no worker types", node.name)));
        }
        if !node.url.starts_with("http://") && !node.url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!("node '{}' has invalid url '{}'", node.name, node.url)));
        }
    }
    Ok(nodes)
}

/// Load the node table from a JSON file.
pub fn load_nodes(path: &Path) -> Result<Vec<NodeConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_nodes(&raw)
}
