//! Status enums for tasks, worker classes and compute instances.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task accepted but not yet executing.
    #[default]
    Pending,
    /// Agent session is live.
    Running,
    /// Agent exited successfully.
    Completed,
    /// Provisioning failed or the agent exited with an error.
    Failed,
    /// Task was cancelled by user or system.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the task still occupies a capacity slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `pending -> running -> {completed, failed, cancelled}`; pending tasks
    /// may also fail or be cancelled directly. Terminal states are final.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker class requested for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    /// Largest model, always-on machine preferred.
    Opus,
    /// Default model, any node.
    #[default]
    Auto,
    /// Alternative provider routed through an Anthropic-compatible endpoint.
    Glm,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Auto => "auto",
            Self::Glm => "glm",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-observed state of the ephemeral compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Stopped; no compute is billed.
    Terminated,
    /// Any transitional state (staging, stopping, repairing...).
    Provisioning,
    /// Booted at the provider level. Says nothing about the orchestrator.
    Running,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Terminated => "terminated",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
        };
        f.write_str(s)
    }
}

/// Health of the worker orchestrator as seen through its health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    Ready,
    NotReady,
    Unreachable,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::NotReady => "not-ready",
            Self::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}
