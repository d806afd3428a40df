//! Start/stop decisions for the ephemeral worker instance.
//!
//! Every operation re-reads provider state before acting; the only local
//! memory is the idle and unreachable clocks used to defer shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskfleet_core::{HealthStatus, InstanceState};
use taskfleet_proto::{ComputeStatusResponse, StartResponse, StopResponse};

use crate::probe::HealthProbe;
use crate::provider::{ComputeProvider, ProviderError};

/// Timing knobs for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval between provider status polls.
    pub status_poll_interval: Duration,
    /// Deadline for the provider to report a target state.
    pub instance_timeout: Duration,
    /// Interval between health probes while booting.
    pub health_poll_interval: Duration,
    /// Deadline for the orchestrator to become ready after boot.
    pub health_timeout: Duration,
    /// Zero running tasks must be observed this long before shutdown.
    pub idle_grace: Duration,
    /// Unreachable or not-ready this long means shut down anyway.
    pub unreachable_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(5),
            instance_timeout: Duration::from_secs(5 * 60),
            health_poll_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(10 * 60),
            idle_grace: Duration::from_secs(30 * 60),
            unreachable_timeout: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Error)]
enum LifecycleError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Clocks driving deferred shutdown.
#[derive(Debug, Default)]
struct IdleClock {
    idle_since: Option<Instant>,
    unhealthy_since: Option<Instant>,
}

impl IdleClock {
    fn reset(&mut self) {
        self.idle_since = None;
        self.unhealthy_since = None;
    }
}

/// Decision taken by one stop evaluation.
enum StopDecision {
    Shutdown { running_tasks: Option<u32>, reason: String },
    Defer(String),
}

pub struct LifecycleManager {
    provider: Arc<dyn ComputeProvider>,
    probe: Arc<dyn HealthProbe>,
    config: LifecycleConfig,
    /// Serializes start and stop; also guards the idle clocks.
    op: Mutex<IdleClock>,
}

impl LifecycleManager {
    pub fn new(provider: Arc<dyn ComputeProvider>, probe: Arc<dyn HealthProbe>, config: LifecycleConfig) -> Arc<Self> {
        Arc::new(Self {
            provider,
            probe,
            config,
            op: Mutex::new(IdleClock::default()),
        })
    }

    /// Bring the instance to running with a ready orchestrator.
    pub async fn start_instance(&self) -> StartResponse {
        let mut clock = self.op.lock().await;
        let began = Instant::now();

        match self.start_locked().await {
            Ok(true) => StartResponse {
                success: true,
                message: "instance already running".to_string(),
                startup_duration_ms: Some(0),
            },
            Ok(false) => {
                clock.reset();
                let elapsed = began.elapsed();
                info!(startup_ms = elapsed.as_millis() as u64, "Instance started and ready");
                StartResponse {
                    success: true,
                    message: "instance started".to_string(),
                    startup_duration_ms: Some(elapsed.as_millis() as u64),
                }
            }
            Err(e) => {
                warn!(error = %e, "Instance start failed");
                StartResponse {
                    success: false,
                    message: e.to_string(),
                    startup_duration_ms: None,
                }
            }
        }
    }

    /// Returns `true` when nothing had to be done.
    async fn start_locked(&self) -> Result<bool, LifecycleError> {
        let mut state = self.provider.status().await?;
        if state == InstanceState::Provisioning {
            debug!("Instance in transition, waiting for it to settle");
            state = self.wait_settled().await?;
        }

        if state == InstanceState::Running {
            let probe = self.probe.probe().await;
            if probe.health == HealthStatus::Ready {
                return Ok(true);
            }
            warn!(health = %probe.health, "Instance running but orchestrator not ready, restarting");
            self.provider.stop().await?;
            self.wait_for(InstanceState::Terminated).await?;
        }

        info!("Starting instance");
        self.provider.start().await?;
        self.wait_for(InstanceState::Running).await?;
        self.wait_ready().await?;
        Ok(false)
    }

    async fn wait_for(&self, target: InstanceState) -> Result<(), LifecycleError> {
        let what = match target {
            InstanceState::Running => "instance to reach running",
            InstanceState::Terminated => "instance to stop",
            InstanceState::Provisioning => "instance transition",
        };
        let mut ticker = tokio::time::interval(self.config.status_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::time::timeout(self.config.instance_timeout, async {
            loop {
                ticker.tick().await;
                if self.provider.status().await? == target {
                    return Ok::<(), LifecycleError>(());
                }
            }
        })
        .await
        .map_err(|_| LifecycleError::Timeout(what))?
    }

    async fn wait_settled(&self) -> Result<InstanceState, LifecycleError> {
        let mut ticker = tokio::time::interval(self.config.status_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::time::timeout(self.config.instance_timeout, async {
            loop {
                ticker.tick().await;
                let state = self.provider.status().await?;
                if state != InstanceState::Provisioning {
                    return Ok::<_, LifecycleError>(state);
                }
            }
        })
        .await
        .map_err(|_| LifecycleError::Timeout("instance transition"))?
    }

    async fn wait_ready(&self) -> Result<(), LifecycleError> {
        let mut ticker = tokio::time::interval(self.config.health_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::time::timeout(self.config.health_timeout, async {
            loop {
                ticker.tick().await;
                if self.probe.probe().await.health == HealthStatus::Ready {
                    return;
                }
            }
        })
        .await
        .map_err(|_| LifecycleError::Timeout("orchestrator health"))
    }

    /// Shut the instance down once it has been idle for the grace period.
    pub async fn stop_instance(&self) -> StopResponse {
        let mut clock = self.op.lock().await;

        let state = match self.provider.status().await {
            Ok(state) => state,
            Err(e) => return stop_failure(e.to_string()),
        };
        if state == InstanceState::Terminated {
            clock.reset();
            return StopResponse {
                success: true,
                message: "instance already stopped".to_string(),
                running_tasks_at_shutdown: None,
            };
        }

        match self.evaluate_stop(&mut clock).await {
            StopDecision::Defer(reason) => {
                debug!(reason = %reason, "Stop deferred");
                stop_failure(reason)
            }
            StopDecision::Shutdown { running_tasks, reason } => {
                info!(reason = %reason, "Stopping instance");
                if let Err(e) = self.provider.stop().await {
                    warn!(error = %e, "Instance stop failed");
                    return stop_failure(e.to_string());
                }
                clock.reset();
                StopResponse {
                    success: true,
                    message: format!("instance stopped: {}", reason),
                    running_tasks_at_shutdown: running_tasks,
                }
            }
        }
    }

    async fn evaluate_stop(&self, clock: &mut IdleClock) -> StopDecision {
        let probe = self.probe.probe().await;
        let now = Instant::now();

        match (probe.health, probe.running_tasks) {
            (HealthStatus::Ready, Some(0)) => {
                clock.unhealthy_since = None;
                let since = *clock.idle_since.get_or_insert(now);
                let idle = now.duration_since(since);
                if idle >= self.config.idle_grace {
                    StopDecision::Shutdown {
                        running_tasks: Some(0),
                        reason: format!("idle for {}s", idle.as_secs()),
                    }
                } else {
                    StopDecision::Defer(format!(
                        "idle for {}s of {}s grace period",
                        idle.as_secs(),
                        self.config.idle_grace.as_secs()
                    ))
                }
            }
            (HealthStatus::Ready, running) => {
                clock.reset();
                StopDecision::Defer(format!("{} tasks still running", running.unwrap_or_default()))
            }
            (health, _) => {
                clock.idle_since = None;
                let since = *clock.unhealthy_since.get_or_insert(now);
                let down = now.duration_since(since);
                if down >= self.config.unreachable_timeout {
                    StopDecision::Shutdown {
                        running_tasks: None,
                        reason: format!("orchestrator {} for {}s", health, down.as_secs()),
                    }
                } else {
                    StopDecision::Defer(format!("orchestrator {} for {}s", health, down.as_secs()))
                }
            }
        }
    }

    /// Provider state plus orchestrator health.
    pub async fn status(&self) -> Result<ComputeStatusResponse, ProviderError> {
        let instance_state = self.provider.status().await?;
        let probe = match instance_state {
            InstanceState::Running => self.probe.probe().await,
            _ => crate::probe::ProbeResult::unreachable(),
        };
        Ok(ComputeStatusResponse {
            instance_state,
            health: probe.health,
            running_tasks: probe.running_tasks,
        })
    }
}

fn stop_failure(message: String) -> StopResponse {
    StopResponse {
        success: false,
        message,
        running_tasks_at_shutdown: None,
    }
}

/// Evaluate shutdown every `interval` while the instance is running.
pub fn spawn_idle_monitor(
    interval: Duration,
    manager: Arc<LifecycleManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match manager.provider.status().await {
                        Ok(InstanceState::Running) => {
                            let result = manager.stop_instance().await;
                            if result.success {
                                info!(message = %result.message, "Idle monitor stopped instance");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Idle monitor could not read instance state"),
                    }
                }
            }
        }
        debug!("Idle monitor stopped");
    })
}
