//! TaskFleet Compute Manager

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskfleet_compute::{
    http, spawn_idle_monitor, AppState, ComputeProvider, Config, GcloudProvider, HealthProbe, HttpHealthProbe,
    LifecycleConfig, LifecycleManager, ProcessRunner,
};

/// TaskFleet compute manager.
#[derive(Parser, Debug)]
#[command(name = "taskfleet-compute", about = "Starts and stops the ephemeral worker instance")]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "FLEET_BIND", default_value = "0.0.0.0:8070")]
    bind: String,

    /// Bearer token for the control endpoints
    #[arg(long, env = "FLEET_COMPUTE_TOKEN", hide_env_values = true)]
    api_token: String,

    /// Cloud project
    #[arg(long, env = "FLEET_GCP_PROJECT")]
    project: String,

    /// Instance zone
    #[arg(long, env = "FLEET_GCP_ZONE", default_value = "us-central1-a")]
    zone: String,

    /// Instance name
    #[arg(long, env = "FLEET_GCP_INSTANCE", default_value = "taskfleet-ephemeral")]
    instance: String,

    /// gcloud executable
    #[arg(long, env = "FLEET_GCLOUD", default_value = "gcloud")]
    gcloud: String,

    /// Worker orchestrator base URL on the instance
    #[arg(long, env = "FLEET_ORCHESTRATOR_URL")]
    orchestrator_url: String,

    /// Minutes of zero running tasks before shutdown
    #[arg(long, env = "FLEET_IDLE_GRACE_MINS", default_value = "30")]
    idle_grace_mins: u64,

    /// Minutes of an unreachable orchestrator before shutdown
    #[arg(long, env = "FLEET_UNREACHABLE_MINS", default_value = "15")]
    unreachable_mins: u64,

    /// Seconds to wait for the instance to reach a state
    #[arg(long, env = "FLEET_INSTANCE_TIMEOUT_SECS", default_value = "300")]
    instance_timeout_secs: u64,

    /// Seconds to wait for the orchestrator to become ready
    #[arg(long, env = "FLEET_HEALTH_TIMEOUT_SECS", default_value = "600")]
    health_timeout_secs: u64,

    /// Idle monitor interval in seconds
    #[arg(long, env = "FLEET_IDLE_CHECK_SECS", default_value = "60")]
    idle_check_secs: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            bind_addr: self.bind,
            api_token: self.api_token,
            project: self.project,
            zone: self.zone,
            instance: self.instance,
            gcloud_program: self.gcloud,
            orchestrator_url: self.orchestrator_url,
            idle_check_interval: Duration::from_secs(self.idle_check_secs.max(1)),
            lifecycle: LifecycleConfig {
                instance_timeout: Duration::from_secs(self.instance_timeout_secs),
                health_timeout: Duration::from_secs(self.health_timeout_secs),
                idle_grace: Duration::from_secs(self.idle_grace_mins * 60),
                unreachable_timeout: Duration::from_secs(self.unreachable_mins * 60),
                ..defaults.lifecycle
            },
            ..defaults
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

    if args.api_token.trim().is_empty() {
        return Err("FLEET_COMPUTE_TOKEN must not be empty".into());
    }

    let config = args.into_config();
    let addr: SocketAddr = config.bind_addr.parse()?;

    info!(
        project = %config.project,
        zone = %config.zone,
        instance = %config.instance,
        orchestrator = %config.orchestrator_url,
        "Starting TaskFleet compute manager"
    );

    let runner = Arc::new(ProcessRunner {
        timeout: config.provider_timeout,
    });
    let provider: Arc<dyn ComputeProvider> = Arc::new(
        GcloudProvider::new(runner, &config.project, &config.zone, &config.instance)
            .with_program(&config.gcloud_program),
    );
    let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new(&config.orchestrator_url, config.probe_timeout)?);
    let lifecycle = LifecycleManager::new(provider, probe, config.lifecycle.clone());

    let shutdown = CancellationToken::new();
    let monitor = spawn_idle_monitor(config.idle_check_interval, lifecycle.clone(), shutdown.clone());

    let router = http::create_router(AppState::new(lifecycle, config.api_token.clone()));
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
    let _ = monitor.await;

    info!("TaskFleet compute manager stopped");
    Ok(())
}
