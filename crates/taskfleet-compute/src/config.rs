//! Compute manager configuration.

use std::time::Duration;

use crate::lifecycle::LifecycleConfig;

/// Compute manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub bind_addr: String,

    /// Bearer token for `/start`, `/stop` and `/status`.
    pub api_token: String,

    /// Cloud project holding the instance.
    pub project: String,

    /// Zone of the instance.
    pub zone: String,

    /// Instance name.
    pub instance: String,

    /// Provider CLI executable.
    pub gcloud_program: String,

    /// Timeout for a single provider CLI call.
    pub provider_timeout: Duration,

    /// Base URL of the worker orchestrator on the instance.
    pub orchestrator_url: String,

    /// Timeout for one health probe.
    pub probe_timeout: Duration,

    /// How often the idle monitor evaluates shutdown.
    pub idle_check_interval: Duration,

    /// Start/stop timing.
    pub lifecycle: LifecycleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8070".to_string(),
            api_token: String::new(),
            project: String::new(),
            zone: "us-central1-a".to_string(),
            instance: "taskfleet-ephemeral".to_string(),
            gcloud_program: "gcloud".to_string(),
            provider_timeout: Duration::from_secs(120),
            orchestrator_url: "http://localhost:8080".to_string(),
            probe_timeout: Duration::from_secs(5),
            idle_check_interval: Duration::from_secs(60),
            lifecycle: LifecycleConfig::default(),
        }
    }
}
