//! Agent sessions in detached tmux sessions.
//!
//! Sessions are created with `remain-on-exit` so a finished agent leaves a
//! dead pane behind. Its exit status is how completion is detected, see
//! [`SessionManager::session_state`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskfleet_core::{IssueRef, TaskId};

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::AgentProfile;
use crate::prompt::{build_instruction, PromptContext};

/// Prefix of every session this worker creates.
pub const SESSION_PREFIX: &str = "taskfleet-";

/// How long a graceful kill waits after Ctrl-C.
pub const GRACEFUL_KILL_WAIT: Duration = Duration::from_secs(10);

const TMUX: &str = "tmux";

/// Environment variable carrying the agent's OAuth token.
const AGENT_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already running: {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to prepare log directory {}: {source}", .path.display())]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Observed state of a task's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Agent process still running.
    Running,
    /// Agent exited; the dead pane carries its status.
    Exited(i32),
    /// No such session.
    Missing,
}

/// Builder for the agent command line.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    program: String,
    model: Option<String>,
    env_vars: Vec<(String, String)>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: None,
            env_vars: Vec::new(),
        }
    }

    pub fn from_profile(profile: &AgentProfile) -> Self {
        let mut cmd = Self::new(profile.program.clone());
        if let Some(model) = &profile.model {
            cmd = cmd.with_model(model.clone());
        }
        for (key, value) in &profile.env {
            cmd = cmd.with_env(key.clone(), value.clone());
        }
        cmd
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Full argv, program first. The instruction is one element.
    pub fn argv(&self, instruction: &str) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &self.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        argv.push(instruction.to_string());
        argv
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env_vars
    }
}

/// Inputs for [`SessionManager::start_session`].
#[derive(Debug, Clone)]
pub struct StartParams {
    pub task_id: TaskId,
    pub workspace: PathBuf,
    pub prompt: String,
    pub issue: Option<IssueRef>,
    pub agent: AgentProfile,
}

/// A started session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub log_path: PathBuf,
}

/// Starts, inspects and stops agent sessions.
pub struct SessionManager {
    runner: Arc<dyn CommandRunner>,
    log_dir: PathBuf,
    machine: String,
    agent_token: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(runner: Arc<dyn CommandRunner>, log_dir: impl Into<PathBuf>, machine: impl Into<String>) -> Self {
        Self {
            runner,
            log_dir: log_dir.into(),
            machine: machine.into(),
            agent_token: RwLock::new(None),
        }
    }

    /// Session name for a task.
    pub fn session_name(task_id: &TaskId) -> String {
        format!("{}{}", SESSION_PREFIX, task_id)
    }

    /// Log file a task's pane output is appended to.
    pub fn log_path(&self, task_id: &TaskId) -> PathBuf {
        self.log_dir.join(format!("{}.log", task_id))
    }

    /// Replace the token injected into new sessions.
    pub async fn set_agent_token(&self, token: Option<String>) {
        *self.agent_token.write().await = token;
    }

    pub async fn has_agent_token(&self) -> bool {
        self.agent_token.read().await.is_some()
    }

    /// Launch the agent for a task.
    pub async fn start_session(&self, params: &StartParams) -> Result<SessionInfo, SessionError> {
        let name = Self::session_name(&params.task_id);

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|source| SessionError::LogDir {
                path: self.log_dir.clone(),
                source,
            })?;

        if self.session_exists(&name).await? {
            return Err(SessionError::AlreadyRunning(name));
        }

        let log_path = self.log_path(&params.task_id);
        let instruction = build_instruction(
            &PromptContext {
                task_id: &params.task_id,
                workspace: &params.workspace,
                machine: &self.machine,
                issue: params.issue.as_ref(),
            },
            &params.prompt,
        );

        let agent = AgentCommand::from_profile(&params.agent);
        let mut env: Vec<(String, String)> = agent.env().to_vec();
        if let Some(token) = self.agent_token.read().await.clone() {
            env.push((AGENT_TOKEN_ENV.to_string(), token));
        }

        let workspace = params.workspace.display().to_string();
        let mut spec = CommandSpec::new(TMUX).args([
            "new-session",
            "-d",
            "-s",
            name.as_str(),
            "-c",
        ]);
        spec = spec.arg(escape_separator(&workspace));
        for (key, value) in &env {
            spec = spec.arg("-e").arg(escape_separator(&format!("{}={}", key, value)));
        }
        spec = spec
            .arg("--")
            .args(agent.argv(&instruction).iter().map(|a| escape_separator(a)))
            .args([";", "set-option", "-w", "-t", name.as_str(), "remain-on-exit", "on"])
            .args([";", "pipe-pane", "-o", "-t", name.as_str()])
            .arg(format!("cat >> {}", shell_quote(&log_path)));

        self.runner.run_checked(&spec).await?;

        info!(
            task_id = %params.task_id,
            session = %name,
            log_path = %log_path.display(),
            model = ?params.agent.model,
            "Session started"
        );

        Ok(SessionInfo { name, log_path })
    }

    /// Terminate a task's session. An absent session is not an error.
    pub async fn kill_session(&self, task_id: &TaskId, graceful: bool) -> Result<(), SessionError> {
        let name = Self::session_name(task_id);
        let state = self.session_state(task_id).await?;

        if state == SessionState::Missing {
            debug!(task_id = %task_id, "No session to kill");
            return Ok(());
        }

        if graceful && state == SessionState::Running {
            debug!(task_id = %task_id, "Sending interrupt to session");
            self.runner
                .run(&CommandSpec::new(TMUX).args(["send-keys", "-t", exact(&name).as_str(), "C-c"]))
                .await?;
            tokio::time::sleep(GRACEFUL_KILL_WAIT).await;

            match self.session_state(task_id).await? {
                SessionState::Missing => return Ok(()),
                SessionState::Running => {
                    warn!(task_id = %task_id, "Session ignored interrupt, forcing kill");
                }
                SessionState::Exited(_) => {}
            }
        }

        let output = self
            .runner
            .run(&CommandSpec::new(TMUX).args(["kill-session", "-t", exact(&name).as_str()]))
            .await?;
        if !output.success() && !is_missing_session(&output.stderr) {
            return Err(CommandError::Failed {
                program: TMUX.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }

        info!(task_id = %task_id, graceful, "Session killed");
        Ok(())
    }

    /// True while the agent process is alive.
    pub async fn is_session_running(&self, task_id: &TaskId) -> Result<bool, SessionError> {
        Ok(self.session_state(task_id).await? == SessionState::Running)
    }

    /// Running, exited with a code, or missing.
    pub async fn session_state(&self, task_id: &TaskId) -> Result<SessionState, SessionError> {
        let name = Self::session_name(task_id);
        let output = self
            .runner
            .run(&CommandSpec::new(TMUX).args([
                "list-panes",
                "-s",
                "-t",
                exact(&name).as_str(),
                "-F",
                "#{pane_dead} #{pane_dead_status}",
            ]))
            .await?;

        if !output.success() {
            if is_missing_session(&output.stderr) {
                return Ok(SessionState::Missing);
            }
            return Err(CommandError::Failed {
                program: TMUX.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }

        Ok(parse_pane_state(&output.stdout))
    }

    /// Names of all sessions created by this worker.
    pub async fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        let output = self
            .runner
            .run(&CommandSpec::new(TMUX).args(["list-sessions", "-F", "#{session_name}"]))
            .await?;

        if !output.success() {
            if is_missing_session(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(CommandError::Failed {
                program: TMUX.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(SESSION_PREFIX))
            .map(str::to_string)
            .collect())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, SessionError> {
        let output = self
            .runner
            .run(&CommandSpec::new(TMUX).args(["has-session", "-t", exact(name).as_str()]))
            .await?;
        Ok(output.success())
    }
}

/// tmux splits commands on an argument that ends in `;`. A trailing `\;`
/// is read back as a literal `;`.
fn escape_separator(arg: &str) -> String {
    match arg.strip_suffix(';') {
        Some(head) => format!("{}\\;", head),
        None => arg.to_string(),
    }
}

/// Exact-match target, so `taskfleet-a` never matches `taskfleet-ab`.
fn exact(name: &str) -> String {
    format!("={}", name)
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find")
        || stderr.contains("no server running")
        || stderr.contains("error connecting")
        || stderr.contains("session not found")
}

/// Any live pane means the agent is still running.
fn parse_pane_state(stdout: &str) -> SessionState {
    let mut exit_code = None;
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("0") => return SessionState::Running,
            Some("1") => {
                let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);
                exit_code.get_or_insert(code);
            }
            _ => {}
        }
    }
    exit_code.map_or(SessionState::Missing, SessionState::Exited)
}

/// Single-quote a path for the `pipe-pane` shell command.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}
