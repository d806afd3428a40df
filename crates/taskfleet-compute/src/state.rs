//! Shared application state.

use std::sync::Arc;

use crate::lifecycle::LifecycleManager;

/// Shared application state.
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    /// Bearer token for the control endpoints.
    pub api_token: String,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(lifecycle: Arc<LifecycleManager>, api_token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            api_token: api_token.into(),
        })
    }
}
