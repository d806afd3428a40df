//! Task type and its state machine.

use crate::{CoreError, NodeId, TaskId, TaskStatus, WorkerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to an external issue tracker entry the agent must pick up first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    /// Tracker identifier (e.g. "ENG-142").
    pub id: String,

    /// Issue title, if the caller supplied one.
    pub title: Option<String>,
}

/// A Task is one autonomous agent run on one worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (caller supplied).
    pub id: TaskId,

    /// Requested worker class.
    pub worker_type: WorkerType,

    /// Raw prompt text as submitted. Sanitized before it reaches a session.
    pub prompt: String,

    /// Source repository name, if not the node's default.
    pub repository: Option<String>,

    /// Base branch the workspace is created from.
    pub base_branch: Option<String>,

    /// External issue the agent has to handle first.
    pub issue: Option<IssueRef>,

    /// Short human-readable name used for the task branch.
    pub slug: Option<String>,

    /// Caller-side action identifier, echoed back in status reports.
    pub action_id: Option<String>,

    /// Where status webhooks are delivered.
    pub webhook_url: String,

    /// Key used to sign status webhooks. Never serialized.
    #[serde(skip)]
    pub webhook_secret: String,

    /// Node hosting the task, once dispatched.
    pub node: Option<NodeId>,

    /// Current task status.
    pub status: TaskStatus,

    /// Error message if the task failed.
    pub error_message: Option<String>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the agent session started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(id: TaskId, worker_type: WorkerType, prompt: impl Into<String>) -> Self {
        Self {
            id,
            worker_type,
            prompt: prompt.into(),
            repository: None,
            base_branch: None,
            issue: None,
            slug: None,
            action_id: None,
            webhook_url: String::new(),
            webhook_secret: String::new(),
            node: None,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Builder method to set the webhook target.
    pub fn with_webhook(mut self, url: impl Into<String>, secret: impl Into<String>) -> Self {
        self.webhook_url = url.into();
        self.webhook_secret = secret.into();
        self
    }

    /// Builder method to set the base branch.
    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = Some(branch.into());
        self
    }

    /// Builder method to attach an external issue.
    pub fn with_issue(mut self, id: impl Into<String>, title: Option<String>) -> Self {
        self.issue = Some(IssueRef {
            id: id.into(),
            title,
        });
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        } else if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }
}

/// Longest accepted branch name.
pub const MAX_BRANCH_NAME_LEN: usize = 200;

/// Reject branch names git would refuse, and anything that could be read
/// as a command-line option.
pub fn validate_branch_name(name: &str) -> Result<(), CoreError> {
    let invalid = |reason: &str| Err(CoreError::InvalidInput(format!("invalid branch name {:?}: {}", name, reason)));

    if name.is_empty() {
        return invalid("empty");
    }
    if name.len() > MAX_BRANCH_NAME_LEN {
        return invalid("too long");
    }
    if name.starts_with('-') {
        return invalid("starts with '-'");
    }
    if name.chars().any(|c| c.is_ascii_control() || c.is_whitespace() || "~^:?*[\\".contains(c)) {
        return invalid("contains a forbidden character");
    }
    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return invalid("contains a forbidden sequence");
    }
    if name == "@" || name.starts_with('/') || name.ends_with('/') || name.ends_with('.') || name.ends_with(".lock") {
        return invalid("malformed");
    }
    if name.split('/').any(|part| part.starts_with('.')) {
        return invalid("component starts with '.'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(TaskId::new("t-1"), WorkerType::Auto, "fix the build")
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.started_at.is_none());

        t.transition(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        assert!(t.finished_at.is_none());

        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.finished_at.is_some());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut t = task();
        t.fail("workspace creation failed").unwrap();
        assert_eq!(t.error_message.as_deref(), Some("workspace creation failed"));

        let err = t.transition(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn test_validate_branch_name() {
        for ok in ["main", "development", "feature/login-fix", "release-1.2", "user/x_y"] {
            assert!(validate_branch_name(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "--upload-pack=touch /tmp/pwned; git-upload-pack",
            "-b",
            "a b",
            "a..b",
            "a~1",
            "refs/heads/x:y",
            "x@{1}",
            "feature/",
            "/main",
            "a//b",
            "x.lock",
            "feature/.hidden",
            "tab\tname",
            "@",
        ] {
            assert!(
                matches!(validate_branch_name(bad), Err(CoreError::InvalidInput(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_webhook_secret_not_serialized() {
        let t = task().with_webhook("http://dispatcher/hook", "s3cret");
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("http://dispatcher/hook"));
        assert!(!json.contains("s3cret"));
    }
}
