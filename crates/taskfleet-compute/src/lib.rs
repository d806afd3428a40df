//! TaskFleet Compute Manager Library
//!
//! Starts the ephemeral worker instance on demand and stops it once the
//! orchestrator on it has been idle long enough.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod probe;
pub mod provider;
pub mod state;

pub use config::Config;
pub use lifecycle::{spawn_idle_monitor, LifecycleConfig, LifecycleManager};
pub use probe::{HealthProbe, HttpHealthProbe, ProbeResult};
pub use provider::{CliRunner, ComputeProvider, GcloudProvider, ProcessRunner, ProviderError};
pub use state::AppState;
