//! TaskFleet Worker Daemon

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskfleet_core::WorkerType;
use taskfleet_proto::DispatchVerifier;
use taskfleet_worker::config::{default_agents, AgentProfile};
use taskfleet_worker::workspace::ConfigTemplate;
use taskfleet_worker::{
    http, spawn_sweeper, spawn_task_evictor, AppState, CommandRunner, Config, FileLogStore, ForwarderConfig, HttpLogStore,
    LogForwarder, LogStore, LogStoreConfig, Orchestrator, SessionManager, SweepConfig, TokioCommandRunner,
    WebhookNotifier, WorkspaceManager,
};

/// How often finished tasks are checked against their retention.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Environment variables with this prefix become template variables.
const TEMPLATE_ENV_PREFIX: &str = "FLEET_TEMPLATE_";

/// TaskFleet worker node.
#[derive(Parser, Debug)]
#[command(name = "taskfleet-worker", about = "Runs coding agents in isolated worktrees")]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "FLEET_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Machine name reported to agents
    #[arg(long, env = "FLEET_NODE_NAME", default_value = "always-on")]
    node_name: String,

    /// Maximum concurrent tasks
    #[arg(long, env = "FLEET_CAPACITY", default_value = "5")]
    capacity: u32,

    /// Shared secret for signed dispatch requests
    #[arg(long, env = "FLEET_DISPATCH_SECRET", hide_env_values = true)]
    dispatch_secret: String,

    /// Bearer token for admin endpoints
    #[arg(long, env = "FLEET_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Default repository checkout
    #[arg(long, env = "FLEET_REPO_DIR", default_value = "/var/lib/taskfleet/repo")]
    repo_dir: PathBuf,

    /// Additional repositories as name=path
    #[arg(long = "repository", env = "FLEET_REPOSITORIES", value_delimiter = ',', value_parser = parse_key_value)]
    repositories: Vec<(String, String)>,

    /// Base branch when a task names none
    #[arg(long, env = "FLEET_DEFAULT_BASE_BRANCH", default_value = "development")]
    default_base_branch: String,

    /// Root directory for task worktrees
    #[arg(long, env = "FLEET_WORKTREES_ROOT", default_value = "/var/lib/taskfleet/worktrees")]
    worktrees_root: PathBuf,

    /// Directory for per-task session logs
    #[arg(long, env = "FLEET_LOG_DIR", default_value = "/var/lib/taskfleet/logs")]
    log_dir: PathBuf,

    /// Template rendered into every workspace
    #[arg(long, env = "FLEET_ENV_TEMPLATE")]
    env_template: Option<PathBuf>,

    /// File name of the rendered template
    #[arg(long, env = "FLEET_ENV_FILE_NAME", default_value = ".env.local")]
    env_file_name: String,

    /// Dependency installation timeout in seconds
    #[arg(long, env = "FLEET_INSTALL_TIMEOUT_SECS", default_value = "300")]
    install_timeout_secs: u64,

    /// Agent CLI executable
    #[arg(long, env = "FLEET_AGENT_PROGRAM", default_value = "claude")]
    agent_program: String,

    /// Model used by the glm worker class
    #[arg(long, env = "FLEET_GLM_MODEL")]
    glm_model: Option<String>,

    /// Anthropic-compatible endpoint for the glm worker class
    #[arg(long, env = "FLEET_GLM_BASE_URL")]
    glm_base_url: Option<String>,

    /// Initial agent OAuth token
    #[arg(long, env = "FLEET_AGENT_TOKEN", hide_env_values = true)]
    agent_token: Option<String>,

    /// Session completion poll interval in seconds
    #[arg(long, env = "FLEET_POLL_INTERVAL_SECS", default_value = "5")]
    poll_interval_secs: u64,

    /// Stale worktree sweep interval in seconds
    #[arg(long, env = "FLEET_SWEEP_INTERVAL_SECS", default_value = "3600")]
    sweep_interval_secs: u64,

    /// Age in hours after which a worktree is swept
    #[arg(long, env = "FLEET_STALE_HOURS", default_value = "24")]
    stale_hours: u64,

    /// Seconds a finished task stays queryable
    #[arg(long, env = "FLEET_TASK_RETENTION_SECS", default_value = "3600")]
    task_retention_secs: u64,

    /// Directory for JSON Lines chunk files (used without --log-store-url)
    #[arg(long, env = "FLEET_CHUNK_DIR", default_value = "/var/lib/taskfleet/chunks")]
    chunk_dir: PathBuf,

    /// Ingest endpoint for log chunks
    #[arg(long, env = "FLEET_LOG_STORE_URL")]
    log_store_url: Option<String>,

    /// Bearer token for the ingest endpoint
    #[arg(long, env = "FLEET_LOG_STORE_TOKEN", hide_env_values = true)]
    log_store_token: Option<String>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

impl Args {
    fn into_config(self) -> Config {
        let mut agents = default_agents();
        for profile in agents.values_mut() {
            profile.program = self.agent_program.clone();
        }
        if self.glm_model.is_some() || self.glm_base_url.is_some() {
            let mut glm = AgentProfile::new(self.agent_program.clone())
                .with_model(self.glm_model.unwrap_or_else(|| "glm-4.6".to_string()));
            if let Some(url) = self.glm_base_url {
                glm = glm.with_env("ANTHROPIC_BASE_URL", url);
            }
            agents.insert(WorkerType::Glm, glm);
        }

        let template_vars: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| k.strip_prefix(TEMPLATE_ENV_PREFIX).map(|name| (name.to_string(), v)))
            .collect();

        let log_store = match self.log_store_url {
            Some(url) => LogStoreConfig::Http {
                url,
                token: self.log_store_token,
            },
            None => LogStoreConfig::File { dir: self.chunk_dir },
        };

        Config {
            bind_addr: self.bind,
            node_name: self.node_name,
            capacity: self.capacity,
            dispatch_secret: self.dispatch_secret,
            admin_token: self.admin_token,
            repo_dir: self.repo_dir,
            repositories: self
                .repositories
                .into_iter()
                .map(|(name, path)| (name, PathBuf::from(path)))
                .collect(),
            default_base_branch: self.default_base_branch,
            worktrees_root: self.worktrees_root,
            log_dir: self.log_dir,
            env_template: self.env_template,
            env_file_name: self.env_file_name,
            template_vars,
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            agents,
            agent_token: self.agent_token,
            completion_poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(60)),
            stale_threshold: Duration::from_secs(self.stale_hours * 60 * 60),
            task_retention: Duration::from_secs(self.task_retention_secs),
            log_store,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    if args.dispatch_secret.trim().is_empty() {
        return Err("FLEET_DISPATCH_SECRET must not be empty".into());
    }

    let config = Arc::new(args.into_config());
    let addr: SocketAddr = config.bind_addr.parse()?;

    info!(
        node = %config.node_name,
        capacity = config.capacity,
        repo_dir = %config.repo_dir.display(),
        worktrees_root = %config.worktrees_root.display(),
        "Starting TaskFleet worker"
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);

    let mut workspaces = WorkspaceManager::new(runner.clone(), &config.worktrees_root, config.install_timeout);
    if let Some(source) = &config.env_template {
        workspaces = workspaces.with_template(ConfigTemplate {
            source: source.clone(),
            file_name: config.env_file_name.clone(),
            vars: config.template_vars.clone(),
        });
    }
    let workspaces = Arc::new(workspaces);

    let sessions = Arc::new(SessionManager::new(runner, &config.log_dir, config.node_name.clone()));
    sessions.set_agent_token(config.agent_token.clone()).await;

    let store: Arc<dyn LogStore> = match &config.log_store {
        LogStoreConfig::File { dir } => Arc::new(FileLogStore::new(dir)),
        LogStoreConfig::Http { url, token } => Arc::new(HttpLogStore::new(url.clone(), token.clone())?),
    };
    let forwarder = Arc::new(LogForwarder::new(store, ForwarderConfig::default()));

    let orchestrator = Orchestrator::new(
        config.clone(),
        workspaces.clone(),
        sessions,
        forwarder,
        Arc::new(WebhookNotifier::new()?),
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        config.sweep_interval,
        workspaces,
        SweepConfig {
            stale_threshold: config.stale_threshold,
        },
        shutdown.clone(),
    );
    let evictor = spawn_task_evictor(
        EVICTION_INTERVAL,
        config.task_retention,
        orchestrator.clone(),
        shutdown.clone(),
    );

    let state = AppState::new(
        orchestrator.clone(),
        DispatchVerifier::new(config.dispatch_secret.clone()),
        config.admin_token.clone(),
    );
    let router = http::create_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    let _ = evictor.await;
    orchestrator.shutdown().await;

    info!("TaskFleet worker stopped");
    Ok(())
}
