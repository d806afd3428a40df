//! Shared application state.

use std::sync::Arc;

use taskfleet_proto::DispatchVerifier;

use crate::orchestrator::Orchestrator;

/// Shared application state.
pub struct AppState {
    /// Task lifecycle driver.
    pub orchestrator: Arc<Orchestrator>,

    /// Verifies signed dispatch and cancel requests.
    pub verifier: DispatchVerifier,

    /// Bearer token for admin endpoints; admin endpoints reject everything when unset.
    pub admin_token: Option<String>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        verifier: DispatchVerifier,
        admin_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            verifier,
            admin_token,
        })
    }
}
