//! Periodic removal of abandoned worktrees.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workspace::WorkspaceManager;

/// Sweep tuning.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Entries older than this are removed.
    pub stale_threshold: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A stale entry that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepResult {
    pub total: usize,
    pub removed: usize,
    pub errors: Vec<SweepError>,
}

/// Remove every entry under the worktrees root older than the threshold.
pub async fn cleanup_stale_worktrees(workspaces: &WorkspaceManager, config: &SweepConfig) -> SweepResult {
    sweep_at(workspaces, config, SystemTime::now()).await
}

async fn sweep_at(workspaces: &WorkspaceManager, config: &SweepConfig, now: SystemTime) -> SweepResult {
    let mut result = SweepResult::default();

    let mut entries = match tokio::fs::read_dir(workspaces.root()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return result,
        Err(e) => {
            result.errors.push(SweepError {
                path: workspaces.root().to_path_buf(),
                message: e.to_string(),
            });
            return result;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                result.errors.push(SweepError {
                    path: workspaces.root().to_path_buf(),
                    message: e.to_string(),
                });
                break;
            }
        };
        result.total += 1;

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                result.errors.push(SweepError {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < config.stale_threshold {
            continue;
        }

        debug!(path = %path.display(), age_secs = age.as_secs(), "Removing stale entry");
        match remove_entry(workspaces, &path, metadata.is_dir()).await {
            Ok(()) => result.removed += 1,
            Err(message) => result.errors.push(SweepError { path, message }),
        }
    }

    info!(
        total = result.total,
        removed = result.removed,
        errors = result.errors.len(),
        "Stale worktree sweep finished"
    );
    result
}

async fn remove_entry(workspaces: &WorkspaceManager, path: &Path, is_dir: bool) -> Result<(), String> {
    if !is_dir {
        return tokio::fs::remove_file(path).await.map_err(|e| e.to_string());
    }

    match workspaces.remove_worktree_at(path).await {
        Ok(()) => return Ok(()),
        Err(e) if e.is_not_a_worktree() => {
            debug!(path = %path.display(), "Not a registered worktree, removing directly");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Worktree removal failed, removing directly");
        }
    }

    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        // git may have removed it before failing.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Run the sweep every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    interval: Duration,
    workspaces: Arc<WorkspaceManager>,
    config: SweepConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let result = cleanup_stale_worktrees(&workspaces, &config).await;
                    for error in &result.errors {
                        warn!(path = %error.path.display(), error = %error.message, "Failed to sweep entry");
                    }
                }
            }
        }
        debug!("Sweeper stopped");
    })
}
