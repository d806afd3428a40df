//! TaskFleet Dispatcher Server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskfleet_dispatcher::config::load_nodes;
use taskfleet_dispatcher::{http, spawn_reconciler, Config, Dispatcher, HttpNodeClient, NodeClient, Scheduler};

/// TaskFleet dispatcher.
#[derive(Parser, Debug)]
#[command(name = "taskfleet-dispatcher", about = "Admits tasks and routes them to worker nodes")]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "FLEET_BIND", default_value = "0.0.0.0:8090")]
    bind: String,

    /// Maximum concurrently active tasks across the fleet
    #[arg(long, env = "FLEET_CAPACITY", default_value = "5")]
    capacity: u32,

    /// Shared secret for signed dispatch requests
    #[arg(long, env = "FLEET_DISPATCH_SECRET", hide_env_values = true)]
    dispatch_secret: String,

    /// Externally reachable URL of this dispatcher, used for node webhooks
    #[arg(long, env = "FLEET_PUBLIC_URL", default_value = "http://localhost:8090")]
    public_url: String,

    /// JSON file listing worker nodes
    #[arg(long, env = "FLEET_NODES_FILE", default_value = "/etc/taskfleet/nodes.json")]
    nodes_file: PathBuf,

    /// Reconciliation interval in seconds
    #[arg(long, env = "FLEET_RECONCILE_INTERVAL_SECS", default_value = "30")]
    reconcile_interval_secs: u64,

    /// Timeout for a single node request in seconds
    #[arg(long, env = "FLEET_REQUEST_TIMEOUT_SECS", default_value = "10")]
    request_timeout_secs: u64,

    /// Seconds a finished task stays queryable
    #[arg(long, env = "FLEET_TASK_RETENTION_SECS", default_value = "3600")]
    task_retention_secs: u64,
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

    let nodes = load_nodes(&args.nodes_file)?;
    if nodes.is_empty() {
        warn!(path = %args.nodes_file.display(), "Node table is empty; every submission will be rejected");
    }

    let config = Arc::new(Config {
        bind_addr: args.bind,
        capacity: args.capacity,
        dispatch_secret: args.dispatch_secret,
        public_url: args.public_url,
        nodes,
        reconcile_interval: Duration::from_secs(args.reconcile_interval_secs.max(1)),
        request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
        task_retention: Duration::from_secs(args.task_retention_secs),
    });
    let addr: SocketAddr = config.bind_addr.parse()?;

    info!(
        capacity = config.capacity,
        nodes = config.nodes.len(),
        webhook_url = %config.webhook_url(),
        "Starting TaskFleet dispatcher"
    );

    let client: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(
        config.dispatch_secret.clone(),
        config.request_timeout,
    )?);
    let scheduler = Scheduler::new(config.nodes.clone(), client.clone());
    let dispatcher = Dispatcher::new(config.clone(), scheduler, client);

    let shutdown = CancellationToken::new();
    let reconciler = spawn_reconciler(config.reconcile_interval, dispatcher.clone(), shutdown.clone());

    let router = http::create_router(dispatcher);
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
    let _ = reconciler.await;

    info!("TaskFleet dispatcher stopped");
    Ok(())
}
