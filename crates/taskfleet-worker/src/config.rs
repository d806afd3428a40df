//! Worker node configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use taskfleet_core::WorkerType;

/// How the agent is launched for one worker class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    /// Agent CLI executable.
    pub program: String,

    /// Model passed with `--model`, if any.
    pub model: Option<String>,

    /// Extra environment for the session (e.g. an alternative base URL).
    pub env: Vec<(String, String)>,
}

impl AgentProfile {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: None,
            env: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Where log chunks are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStoreConfig {
    /// Append-only JSON Lines files, one per task.
    File { dir: PathBuf },
    /// POST each chunk to an ingest endpoint.
    Http { url: String, token: Option<String> },
}

/// Worker node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address.
    pub bind_addr: String,

    /// Machine name reported to agents and in logs.
    pub node_name: String,

    /// Maximum concurrent tasks.
    pub capacity: u32,

    /// Shared secret for signed dispatch requests.
    pub dispatch_secret: String,

    /// Bearer token for admin endpoints. Admin endpoints are disabled when unset.
    pub admin_token: Option<String>,

    /// Default repository checkout that worktrees are created from.
    pub repo_dir: PathBuf,

    /// Additional repositories by name.
    pub repositories: HashMap<String, PathBuf>,

    /// Branch used when a task names none.
    pub default_base_branch: String,

    /// Root directory holding one worktree per task.
    pub worktrees_root: PathBuf,

    /// Directory holding one log file per task.
    pub log_dir: PathBuf,

    /// Optional per-task config file template.
    pub env_template: Option<PathBuf>,

    /// File name the rendered template is written to inside the workspace.
    pub env_file_name: String,

    /// Values substituted into the template.
    pub template_vars: HashMap<String, String>,

    /// Upper bound for dependency installation.
    pub install_timeout: Duration,

    /// Agent launch profiles by worker class.
    pub agents: HashMap<WorkerType, AgentProfile>,

    /// Initial agent OAuth token, replaceable through the admin endpoint.
    pub agent_token: Option<String>,

    /// How often running sessions are checked for exit.
    pub completion_poll_interval: Duration,

    /// How often stale worktrees are swept.
    pub sweep_interval: Duration,

    /// Age after which a worktree is considered abandoned.
    pub stale_threshold: Duration,

    /// How long finished tasks stay queryable before they are evicted.
    pub task_retention: Duration,

    /// Chunk persistence backend.
    pub log_store: LogStoreConfig,
}

impl Config {
    /// Repository checkout for a task, falling back to the default.
    pub fn repo_for(&self, repository: Option<&str>) -> PathBuf {
        repository
            .and_then(|name| self.repositories.get(name))
            .cloned()
            .unwrap_or_else(|| self.repo_dir.clone())
    }

    /// Launch profile for a worker class, falling back to `auto`.
    pub fn agent_for(&self, worker_type: WorkerType) -> AgentProfile {
        self.agents
            .get(&worker_type)
            .or_else(|| self.agents.get(&WorkerType::Auto))
            .cloned()
            .unwrap_or_else(|| AgentProfile::new("claude"))
    }
}

/// Default agent profiles: `opus` pins the model, `glm` goes through an
/// Anthropic-compatible endpoint.
pub fn default_agents() -> HashMap<WorkerType, AgentProfile> {
    let mut agents = HashMap::new();
    agents.insert(WorkerType::Opus, AgentProfile::new("claude").with_model("opus"));
    agents.insert(WorkerType::Auto, AgentProfile::new("claude"));
    agents.insert(
        WorkerType::Glm,
        AgentProfile::new("claude")
            .with_model("glm-4.6")
            .with_env("ANTHROPIC_BASE_URL", "https://api.z.ai/api/anthropic"),
    );
    agents
}

impl Default for Config {
    fn default() -> Self {
        let home = PathBuf::from("/var/lib/taskfleet");
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            node_name: "always-on".to_string(),
            capacity: 5,
            dispatch_secret: String::new(),
            admin_token: None,
            repo_dir: home.join("repo"),
            repositories: HashMap::new(),
            default_base_branch: "development".to_string(),
            worktrees_root: home.join("worktrees"),
            log_dir: home.join("logs"),
            env_template: None,
            env_file_name: ".env.local".to_string(),
            template_vars: HashMap::new(),
            install_timeout: Duration::from_secs(300),
            agents: default_agents(),
            agent_token: None,
            completion_poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60 * 60),
            stale_threshold: Duration::from_secs(24 * 60 * 60),
            task_retention: Duration::from_secs(60 * 60),
            log_store: LogStoreConfig::File {
                dir: home.join("chunks"),
            },
        }
    }
}
