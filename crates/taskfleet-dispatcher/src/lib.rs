//! TaskFleet Dispatcher Library
//!
//! This crate provides the dispatcher for TaskFleet: admission control,
//! node selection, signed dispatch to worker nodes, status webhooks and
//! reconciliation.

pub mod config;
pub mod dispatcher;
pub mod http;
pub mod metrics;
pub mod node_client;
pub mod reconciler;
pub mod scheduler;
pub mod state;

pub use config::{Config, ConfigError, NodeConfig};
pub use dispatcher::{DispatchError, Dispatcher};
pub use node_client::{HttpNodeClient, NodeClient, NodeError};
pub use reconciler::spawn_reconciler;
pub use scheduler::{Scheduler, SchedulerError};
pub use state::AppState;
