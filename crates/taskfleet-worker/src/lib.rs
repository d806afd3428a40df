//! TaskFleet Worker Node
//!
//! Accepts signed task dispatches over HTTP and runs each task as an
//! autonomous coding agent inside its own git worktree and tmux session,
//! forwarding the session output to a log store as ordered chunks.

pub mod command;
pub mod config;
pub mod http;
pub mod log_forwarder;
pub mod log_store;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod state;
pub mod sweeper;
pub mod webhook;
pub mod workspace;

pub use command::{CommandError, CommandRunner, CommandSpec, TokioCommandRunner};
pub use config::{AgentProfile, Config, LogStoreConfig};
pub use log_forwarder::{ForwarderConfig, LogForwarder};
pub use log_store::{FileLogStore, HttpLogStore, LogStore, LogStoreError};
pub use orchestrator::{spawn_task_evictor, Orchestrator, OrchestratorError};
pub use session::{SessionError, SessionManager, SessionState};
pub use state::AppState;
pub use sweeper::{cleanup_stale_worktrees, spawn_sweeper, SweepConfig, SweepResult};
pub use webhook::{StatusNotifier, WebhookNotifier};
pub use workspace::{WorkspaceError, WorkspaceManager};
