//! Shared application state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use taskfleet_core::{Task, TaskId};

/// Shared application state.
pub struct AppState {
    /// Tasks indexed by TaskId, including finished ones.
    pub tasks: RwLock<HashMap<TaskId, Task>>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the number of tasks.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Number of tasks still holding a capacity slot.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_active())
            .count()
    }

    /// Drop terminal tasks that finished more than `retention` ago.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.is_terminal() && t.finished_at.is_some_and(|at| at < cutoff)));
        before - tasks.len()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }
}
