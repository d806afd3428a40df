//! Task lifecycle on a worker node.
//!
//! `accept` registers a task and returns right away; provisioning
//! (workspace, session, log capture) and completion watching run on a
//! background task per accepted task. That background task also performs
//! the teardown when the task is cancelled, so session creation and session
//! termination can never race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskfleet_core::{CoreError, Task, TaskId, TaskStatus};
use taskfleet_proto::HealthResponse;

use crate::config::Config;
use crate::log_forwarder::LogForwarder;
use crate::session::{SessionManager, SessionState, StartParams};
use crate::webhook::StatusNotifier;
use crate::workspace::{CreateOptions, WorkspaceManager};

/// Errors returned to API callers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("node at capacity ({running}/{capacity})")]
    AtCapacity { running: usize, capacity: usize },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result of [`Orchestrator::accept`].
#[derive(Debug, Clone)]
pub struct Accepted {
    pub task: Task,
    /// The id was already known; `task` is the existing record.
    pub duplicate: bool,
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
    /// When the task reached a terminal state.
    finished: Option<Instant>,
}

/// Owns the task registry and drives each task to a terminal state.
pub struct Orchestrator {
    config: Arc<Config>,
    workspaces: Arc<WorkspaceManager>,
    sessions: Arc<SessionManager>,
    forwarder: Arc<LogForwarder>,
    notifier: Arc<dyn StatusNotifier>,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        workspaces: Arc<WorkspaceManager>,
        sessions: Arc<SessionManager>,
        forwarder: Arc<LogForwarder>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            workspaces,
            sessions,
            forwarder,
            notifier,
            tasks: RwLock::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity as usize
    }

    /// Admit a task and start provisioning it in the background.
    pub async fn accept(self: &Arc<Self>, task: Task) -> Result<Accepted, OrchestratorError> {
        let cancel = CancellationToken::new();
        {
            let mut tasks = self.tasks.write().await;

            if let Some(existing) = tasks.get(&task.id) {
                debug!(task_id = %task.id, "Duplicate submission");
                return Ok(Accepted {
                    task: existing.task.clone(),
                    duplicate: true,
                });
            }

            let running = tasks.values().filter(|e| e.task.status.is_active()).count();
            if running >= self.capacity() {
                warn!(task_id = %task.id, running, capacity = self.capacity(), "Rejecting task, at capacity");
                return Err(OrchestratorError::AtCapacity {
                    running,
                    capacity: self.capacity(),
                });
            }

            tasks.insert(
                task.id.clone(),
                TaskEntry {
                    task: task.clone(),
                    cancel: cancel.clone(),
                    finished: None,
                },
            );
        }

        info!(
            task_id = %task.id,
            worker_type = %task.worker_type,
            base_branch = ?task.base_branch,
            "Task accepted"
        );

        let this = Arc::clone(self);
        let background = task.clone();
        tokio::spawn(async move { this.run_task(background, cancel).await });

        Ok(Accepted {
            task,
            duplicate: false,
        })
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    pub async fn cancel(self: &Arc<Self>, task_id: &TaskId) -> Result<Task, OrchestratorError> {
        let (task, token) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestratorError::NotFound(task_id.clone()))?;

            if entry.task.is_terminal() {
                return Ok(entry.task.clone());
            }
            entry.task.transition(TaskStatus::Cancelled)?;
            entry.finished = Some(Instant::now());
            (entry.task.clone(), entry.cancel.clone())
        };

        info!(task_id = %task_id, "Task cancelled");
        token.cancel();
        self.notify(task.clone());
        Ok(task)
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(task_id).map(|e| e.task.clone())
    }

    pub async fn running_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|e| e.task.status.is_active())
            .count()
    }

    pub async fn health(&self) -> HealthResponse {
        let running = self.running_count().await as u32;
        let capacity = self.config.capacity;
        HealthResponse {
            status: "ok".to_string(),
            capacity,
            running,
            available: capacity.saturating_sub(running),
        }
    }

    /// Replace the agent credential used by sessions started from now on.
    pub async fn refresh_agent_token(&self, token: String) {
        self.sessions.set_agent_token(Some(token)).await;
        info!("Agent token refreshed");
    }

    /// Forget terminal tasks that finished more than `retention` ago.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, e| !e.finished.is_some_and(|at| at.elapsed() >= retention));
        before - tasks.len()
    }

    /// Flush log forwarding for every task. Sessions keep running.
    pub async fn shutdown(&self) {
        self.forwarder.shutdown().await;
    }

    async fn run_task(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let task_id = task.id.clone();

        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.teardown(&task_id).await;
                return;
            }
            result = self.provision(&task) => result,
        };

        if let Err(message) = provisioned {
            error!(task_id = %task_id, error = %message, "Provisioning failed");
            if let Err(e) = self.sessions.kill_session(&task_id, false).await {
                warn!(task_id = %task_id, error = %e, "Failed to kill session after provisioning failure");
            }
            self.forwarder.stop_forwarding(&task_id).await;
            self.finish(&task_id, TaskStatus::Failed, Some(message)).await;
            return;
        }

        if !self.mark_running(&task_id).await {
            // Cancelled between session start and here.
            self.teardown(&task_id).await;
            return;
        }

        self.watch(&task_id, cancel).await;
    }

    async fn provision(&self, task: &Task) -> Result<(), String> {
        let base_branch = task
            .base_branch
            .clone()
            .unwrap_or_else(|| self.config.default_base_branch.clone());
        let options = CreateOptions {
            repo_dir: self.config.repo_for(task.repository.as_deref()),
            slug: task.slug.clone(),
        };

        let workspace = self
            .workspaces
            .create_workspace(&task.id, &base_branch, &options)
            .await
            .map_err(|e| format!("workspace: {}", e))?;

        let session = self
            .sessions
            .start_session(&StartParams {
                task_id: task.id.clone(),
                workspace,
                prompt: task.prompt.clone(),
                issue: task.issue.clone(),
                agent: self.config.agent_for(task.worker_type),
            })
            .await
            .map_err(|e| format!("session: {}", e))?;

        self.forwarder
            .start_forwarding(&task.id, session.log_path)
            .await;
        Ok(())
    }

    /// Poll the session until the agent exits or the task is cancelled.
    async fn watch(self: &Arc<Self>, task_id: &TaskId, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.completion_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (status, message) = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.teardown(task_id).await;
                    return;
                }
                _ = ticker.tick() => {
                    match self.sessions.session_state(task_id).await {
                        Ok(SessionState::Running) => {}
                        Ok(SessionState::Exited(0)) => break (TaskStatus::Completed, None),
                        Ok(SessionState::Exited(code)) => {
                            break (TaskStatus::Failed, Some(format!("agent exited with code {}", code)))
                        }
                        Ok(SessionState::Missing) => {
                            break (TaskStatus::Failed, Some("session disappeared".to_string()))
                        }
                        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to check session state"),
                    }
                }
            }
        };

        self.forwarder.stop_forwarding(task_id).await;
        if let Err(e) = self.sessions.kill_session(task_id, false).await {
            warn!(task_id = %task_id, error = %e, "Failed to remove finished session");
        }
        self.finish(task_id, status, message).await;
    }

    /// Stop the session gracefully and flush the remaining output.
    async fn teardown(&self, task_id: &TaskId) {
        debug!(task_id = %task_id, "Tearing down cancelled task");
        if let Err(e) = self.sessions.kill_session(task_id, true).await {
            warn!(task_id = %task_id, error = %e, "Failed to kill session");
        }
        self.forwarder.stop_forwarding(task_id).await;
    }

    /// `pending -> running`. False if the task already left `pending`.
    async fn mark_running(self: &Arc<Self>, task_id: &TaskId) -> bool {
        let task = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(task_id) else {
                return false;
            };
            if entry.task.transition(TaskStatus::Running).is_err() {
                return false;
            }
            entry.task.clone()
        };

        info!(task_id = %task_id, "Task running");
        self.notify(task);
        true
    }

    /// Record a terminal state unless the task already reached one.
    async fn finish(self: &Arc<Self>, task_id: &TaskId, status: TaskStatus, message: Option<String>) {
        let task = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.task.transition(status).is_err() {
                debug!(task_id = %task_id, current = %entry.task.status, "Task already finished");
                return;
            }
            entry.task.error_message = message;
            entry.finished = Some(Instant::now());
            entry.task.clone()
        };

        info!(
            task_id = %task_id,
            status = %task.status,
            error = ?task.error_message,
            "Task finished"
        );
        self.notify(task);
    }

    fn notify(self: &Arc<Self>, task: Task) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move { notifier.notify(&task).await });
    }
}

/// Evict finished tasks every `interval` until `shutdown` fires.
pub fn spawn_task_evictor(
    interval: Duration,
    retention: Duration,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = orchestrator.evict_finished(retention).await;
                    if evicted > 0 {
                        debug!(evicted, "Evicted finished tasks");
                    }
                }
            }
        }
        debug!("Task evictor stopped");
    })
}

#[cfg(test)]
mod tests {
    use taskfleet_core::WorkerType;

    use super::*;
    use crate::command::testing::FakeRunner;
    use crate::command::{CommandOutput, CommandRunner};
    use crate::log_forwarder::ForwarderConfig;
    use crate::log_store::testing::MemoryLogStore;
    use crate::webhook::testing::RecordingNotifier;

    struct Harness {
        orch: Arc<Orchestrator>,
        runner: Arc<FakeRunner>,
        notifier: Arc<RecordingNotifier>,
        _tmp: tempfile::TempDir,
    }

    /// Fake git/tmux where the agent pane reports `pane` ("0 " while running).
    fn fake_tools(pane: Arc<std::sync::Mutex<String>>) -> FakeRunner {
        FakeRunner::new(move |spec| match (spec.program.as_str(), spec.args[0].as_str()) {
            ("git", _) if spec.args.get(3).map(String::as_str) == Some("add") => {
                std::fs::create_dir_all(&spec.args[6]).unwrap();
                Ok(CommandOutput::ok(""))
            }
            ("tmux", "has-session") => Ok(CommandOutput::failed(1, "can't find session")),
            ("tmux", "list-panes") => {
                let pane = pane.lock().unwrap().clone();
                if pane.is_empty() {
                    Ok(CommandOutput::failed(1, "can't find session"))
                } else {
                    Ok(CommandOutput::ok(pane))
                }
            }
            _ => Ok(CommandOutput::ok("")),
        })
    }

    fn harness(runner: FakeRunner, capacity: u32) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner);
        let dyn_runner: Arc<dyn CommandRunner> = runner.clone();

        let config = Config {
            capacity,
            worktrees_root: tmp.path().join("worktrees"),
            log_dir: tmp.path().join("logs"),
            completion_poll_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let workspaces = Arc::new(WorkspaceManager::new(
            dyn_runner.clone(),
            &config.worktrees_root,
            config.install_timeout,
        ));
        let sessions = Arc::new(SessionManager::new(dyn_runner, &config.log_dir, "test-node"));
        let forwarder = Arc::new(LogForwarder::new(
            Arc::new(MemoryLogStore::new()),
            ForwarderConfig::default(),
        ));
        let notifier = Arc::new(RecordingNotifier::default());

        let orch = Orchestrator::new(
            Arc::new(config),
            workspaces,
            sessions,
            forwarder,
            notifier.clone(),
        );
        Harness {
            orch,
            runner,
            notifier,
            _tmp: tmp,
        }
    }

    fn task(id: &str) -> Task {
        Task::new(TaskId::new(id), WorkerType::Opus, "Fix the build")
    }

    async fn wait_terminal(orch: &Orchestrator, task_id: &TaskId, timeout: Duration) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = orch.get(task_id).await.unwrap();
            if task.is_terminal() {
                return task;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_status(orch: &Orchestrator, id: &TaskId, status: TaskStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orch.get(id).await.map(|t| t.status) != Some(status) {
            assert!(tokio::time::Instant::now() < deadline, "never reached {status}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn tmux_cmds(runner: &FakeRunner) -> Vec<String> {
        runner.argv_of("tmux").into_iter().map(|a| a[0].clone()).collect()
    }

    #[tokio::test]
    async fn test_successful_task_completes() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane.clone()), 5);
        let id = TaskId::new("t-1");

        let accepted = h.orch.accept(task("t-1")).await.unwrap();
        assert!(!accepted.duplicate);
        assert_eq!(accepted.task.status, TaskStatus::Pending);

        wait_status(&h.orch, &id, TaskStatus::Running).await;
        *pane.lock().unwrap() = "1 0\n".to_string();

        let done = wait_terminal(&h.orch, &id, Duration::from_secs(5)).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.error_message.is_none());
        assert!(tmux_cmds(&h.runner).contains(&"kill-session".to_string()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = h.notifier.events();
        assert!(events.contains(&("t-1".to_string(), TaskStatus::Running)));
        assert!(events.contains(&("t-1".to_string(), TaskStatus::Completed)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_task() {
        let pane = Arc::new(std::sync::Mutex::new("1 2\n".to_string()));
        let h = harness(fake_tools(pane), 5);

        h.orch.accept(task("t-1")).await.unwrap();
        let done = wait_terminal(&h.orch, &TaskId::new("t-1"), Duration::from_secs(5)).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("agent exited with code 2"));
    }

    #[tokio::test]
    async fn test_vanished_session_fails_task() {
        let pane = Arc::new(std::sync::Mutex::new(String::new()));
        let h = harness(fake_tools(pane), 5);

        h.orch.accept(task("t-1")).await.unwrap();
        let done = wait_terminal(&h.orch, &TaskId::new("t-1"), Duration::from_secs(5)).await;
        assert_eq!(done.error_message.as_deref(), Some("session disappeared"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_fails_task() {
        let runner = FakeRunner::new(|spec| {
            if spec.program == "git" && spec.args.contains(&"fetch".to_string()) {
                Ok(CommandOutput::failed(128, "fatal: couldn't find remote ref feature-x"))
            } else if spec.program == "git" {
                Ok(CommandOutput::ok(""))
            } else {
                Ok(CommandOutput::failed(1, "can't find session"))
            }
        });
        let h = harness(runner, 5);

        h.orch.accept(task("t-1")).await.unwrap();
        let done = wait_terminal(&h.orch, &TaskId::new("t-1"), Duration::from_secs(5)).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error_message.unwrap().contains("couldn't find remote ref"));
        assert!(!tmux_cmds(&h.runner).contains(&"new-session".to_string()));
    }

    #[tokio::test]
    async fn test_option_like_base_branch_fails_task_before_git() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 5);
        let id = TaskId::new("t-1");

        h.orch
            .accept(task("t-1").with_base_branch("--upload-pack=touch /tmp/owned"))
            .await
            .unwrap();
        let done = wait_terminal(&h.orch, &id, Duration::from_secs(5)).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error_message.unwrap().contains("invalid base branch"));
        assert!(h.runner.argv_of("git").is_empty());
    }

    #[tokio::test]
    async fn test_capacity_enforced_and_released() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 2);

        h.orch.accept(task("a")).await.unwrap();
        h.orch.accept(task("b")).await.unwrap();
        let err = h.orch.accept(task("c")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AtCapacity { running: 2, capacity: 2 }));
        assert_eq!(h.orch.health().await.available, 0);

        h.orch.cancel(&TaskId::new("a")).await.unwrap();
        h.orch.accept(task("c")).await.unwrap();
        assert_eq!(h.orch.running_count().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_existing() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 1);

        h.orch.accept(task("t-1")).await.unwrap();
        // At capacity, but a retry of a known id is still answered.
        let again = h.orch.accept(task("t-1")).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.task.id, TaskId::new("t-1"));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 5);
        let id = TaskId::new("t-1");

        h.orch.accept(task("t-1")).await.unwrap();
        wait_status(&h.orch, &id, TaskStatus::Running).await;

        let cancelled = h.orch.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !tmux_cmds(&h.runner).contains(&"send-keys".to_string()) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The watcher stopped; the status stays cancelled.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.orch.get(&id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_terminal_and_unknown() {
        let pane = Arc::new(std::sync::Mutex::new("1 0\n".to_string()));
        let h = harness(fake_tools(pane), 5);
        let id = TaskId::new("t-1");

        h.orch.accept(task("t-1")).await.unwrap();
        wait_terminal(&h.orch, &id, Duration::from_secs(5)).await;

        let unchanged = h.orch.cancel(&id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Completed);

        assert!(matches!(
            h.orch.cancel(&TaskId::new("ghost")).await.unwrap_err(),
            OrchestratorError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_provisioning_never_starts_session() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 5);
        let id = TaskId::new("t-1");

        // No await point lets the background task run in between.
        h.orch.accept(task("t-1")).await.unwrap();
        h.orch.cancel(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.orch.get(&id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(!tmux_cmds(&h.runner).contains(&"new-session".to_string()));
        assert!(h.runner.argv_of("git").is_empty());
    }

    #[tokio::test]
    async fn test_evict_finished_keeps_active_tasks() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 5);
        let done = TaskId::new("done");
        let live = TaskId::new("live");

        h.orch.accept(task("done")).await.unwrap();
        h.orch.accept(task("live")).await.unwrap();
        h.orch.cancel(&done).await.unwrap();

        assert_eq!(h.orch.evict_finished(Duration::from_secs(3600)).await, 0);
        assert!(h.orch.get(&done).await.is_some());

        assert_eq!(h.orch.evict_finished(Duration::ZERO).await, 1);
        assert!(h.orch.get(&done).await.is_none());
        assert!(h.orch.get(&live).await.is_some());
    }

    #[tokio::test]
    async fn test_task_evictor_runs_until_shutdown() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 5);
        let id = TaskId::new("t-1");
        h.orch.accept(task("t-1")).await.unwrap();
        h.orch.cancel(&id).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_task_evictor(
            Duration::from_millis(10),
            Duration::ZERO,
            h.orch.clone(),
            shutdown.clone(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.orch.get(&id).await.is_some() {
            assert!(tokio::time::Instant::now() < deadline, "task never evicted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_token_applies_to_new_sessions() {
        let pane = Arc::new(std::sync::Mutex::new("0 \n".to_string()));
        let h = harness(fake_tools(pane), 5);

        h.orch.refresh_agent_token("fresh".to_string()).await;
        h.orch.accept(task("t-1")).await.unwrap();
        wait_status(&h.orch, &TaskId::new("t-1"), TaskStatus::Running).await;

        let start = h
            .runner
            .argv_of("tmux")
            .into_iter()
            .find(|a| a[0] == "new-session")
            .unwrap();
        assert!(start.contains(&"CLAUDE_CODE_OAUTH_TOKEN=fresh".to_string()));
    }
}
