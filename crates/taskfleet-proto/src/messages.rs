//! HTTP request and response bodies.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use taskfleet_core::{
    validate_branch_name, CoreError, HealthStatus, InstanceState, Task, TaskId, TaskStatus, WorkerType,
};

// ============================================================================
// Dispatch (dispatcher -> node)
// ============================================================================

/// Body of `POST /tasks` on a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub task_id: String,
    pub worker_type: WorkerType,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub webhook_url: String,
    pub webhook_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_issue_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

impl DispatchRequest {
    /// Build the wire body for a task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.as_str().to_string(),
            worker_type: task.worker_type,
            prompt: task.prompt.clone(),
            repository: task.repository.clone(),
            base_branch: task.base_branch.clone(),
            webhook_url: task.webhook_url.clone(),
            webhook_secret: task.webhook_secret.clone(),
            linear_issue_id: task.issue.as_ref().map(|i| i.id.clone()),
            linear_issue_title: task.issue.as_ref().and_then(|i| i.title.clone()),
            slug: task.slug.clone(),
            action_id: task.action_id.clone(),
        }
    }

    /// Validate and convert into a pending domain task.
    pub fn into_task(self) -> Result<Task, CoreError> {
        let id = TaskId::parse(self.task_id)?;
        if self.prompt.trim().is_empty() {
            return Err(CoreError::InvalidInput("prompt cannot be empty".to_string()));
        }
        if let Some(branch) = &self.base_branch {
            validate_branch_name(branch)?;
        }

        let mut task = Task::new(id, self.worker_type, self.prompt)
            .with_webhook(self.webhook_url, self.webhook_secret);
        task.repository = self.repository;
        task.base_branch = self.base_branch;
        task.slug = self.slug;
        task.action_id = self.action_id;
        if let Some(issue_id) = self.linear_issue_id.filter(|s| !s.is_empty()) {
            task = task.with_issue(issue_id, self.linear_issue_title);
        }
        Ok(task)
    }

    /// The JSON value that gets signed and sent.
    pub fn to_value(&self) -> Value {
        // Plain structs of strings and enums always serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Signed payload of `DELETE /tasks/:id`.
pub fn cancel_payload(task_id: &TaskId) -> Value {
    json!({ "taskId": task_id.as_str() })
}

/// Body of `POST /v1/tasks` on the dispatcher. The dispatcher fills in the
/// webhook target itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    pub task_id: String,
    #[serde(default)]
    pub worker_type: WorkerType,
    pub prompt: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub linear_issue_id: Option<String>,
    #[serde(default)]
    pub linear_issue_title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub action_id: Option<String>,
}

impl TaskSubmission {
    /// Validate and convert into a pending domain task without webhook target.
    pub fn into_task(self) -> Result<Task, CoreError> {
        DispatchRequest {
            task_id: self.task_id,
            worker_type: self.worker_type,
            prompt: self.prompt,
            repository: self.repository,
            base_branch: self.base_branch,
            webhook_url: String::new(),
            webhook_secret: String::new(),
            linear_issue_id: self.linear_issue_id,
            linear_issue_title: self.linear_issue_title,
            slug: self.slug,
            action_id: self.action_id,
        }
        .into_task()
    }
}

// ============================================================================
// Task responses
// ============================================================================

/// Response to an accepted dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: TaskStatus,
    /// True when the task id was already known (a retried submission).
    #[serde(default)]
    pub duplicate: bool,
}

/// Task status as exposed over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub worker_type: WorkerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.as_str().to_string(),
            status: task.status,
            worker_type: task.worker_type,
            node: task.node.as_ref().map(|n| n.as_str().to_string()),
            error: task.error_message.clone(),
            action_id: task.action_id.clone(),
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            finished_at: task.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// `GET /health` on a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub capacity: u32,
    pub running: u32,
    pub available: u32,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: None,
        }
    }

    pub fn with_message(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Webhooks (node -> dispatcher)
// ============================================================================

/// Status change reported by a node for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub timestamp_ms: i64,
}

impl WebhookEvent {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.as_str().to_string(),
            status: task.status,
            error: task.error_message.clone(),
            action_id: task.action_id.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Admin
// ============================================================================

/// Body of `POST /admin/refresh-token`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshTokenRequest {
    pub token: String,
}

// ============================================================================
// Compute control
// ============================================================================

/// Response of `POST /start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_duration_ms: Option<u64>,
}

/// Response of `POST /stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_tasks_at_shutdown: Option<u32>,
}

/// Response of `GET /status` on the compute manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeStatusResponse {
    pub instance_state: InstanceState,
    pub health: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_tasks: Option<u32>,
}
