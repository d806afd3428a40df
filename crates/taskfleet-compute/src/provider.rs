//! Cloud provider access for the ephemeral instance.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use taskfleet_core::InstanceState;

/// Provider failures. The message is surfaced verbatim to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0}")]
    Api(String),

    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} timed out after {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },
}

/// Start, stop and describe one compute instance.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn status(&self) -> Result<InstanceState, ProviderError>;

    async fn start(&self) -> Result<(), ProviderError>;

    async fn stop(&self) -> Result<(), ProviderError>;
}

/// Map a provider status string onto [`InstanceState`].
pub fn parse_instance_status(raw: &str) -> InstanceState {
    match raw.trim().to_ascii_uppercase().as_str() {
        "RUNNING" => InstanceState::Running,
        "TERMINATED" | "STOPPED" | "SUSPENDED" => InstanceState::Terminated,
        _ => InstanceState::Provisioning,
    }
}

/// Executes the provider CLI. Returns stdout of a successful run.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, ProviderError>;
}

/// Runs the CLI with `tokio::process`, killed when it exceeds `timeout`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pub timeout: Duration,
}

#[async_trait]
impl CliRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, ProviderError> {
        debug!(program, ?args, "Running provider command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout {
                program: program.to_string(),
                after: self.timeout,
            })?
            .map_err(|e| ProviderError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProviderError::Api(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

/// Google Compute Engine through the `gcloud` CLI.
pub struct GcloudProvider {
    runner: Arc<dyn CliRunner>,
    program: String,
    project: String,
    zone: String,
    instance: String,
}

impl GcloudProvider {
    pub fn new(
        runner: Arc<dyn CliRunner>,
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            program: "gcloud".to_string(),
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn argv(&self, verb: &str, extra: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = ["compute", "instances", verb, self.instance.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(format!("--zone={}", self.zone));
        args.push(format!("--project={}", self.project));
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }
}

#[async_trait]
impl ComputeProvider for GcloudProvider {
    async fn status(&self) -> Result<InstanceState, ProviderError> {
        let out = self
            .runner
            .run(&self.program, &self.argv("describe", &["--format=value(status)"]))
            .await?;
        Ok(parse_instance_status(&out))
    }

    async fn start(&self) -> Result<(), ProviderError> {
        self.runner.run(&self.program, &self.argv("start", &["--quiet"])).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.runner.run(&self.program, &self.argv("stop", &["--quiet"])).await?;
        Ok(())
    }
}
