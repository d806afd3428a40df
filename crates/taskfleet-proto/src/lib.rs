//! Wire contract shared by the TaskFleet dispatcher, worker and compute manager.
//!
//! This crate contains:
//! - Request/response bodies for the node and dispatcher REST surfaces
//! - Canonical JSON encoding used for signatures
//! - HMAC-SHA256 dispatch envelopes with replay protection
//! - Converters between wire bodies and domain types

pub mod canonical;
pub mod messages;
pub mod signing;

pub use canonical::canonical_json;
pub use messages::{
    cancel_payload, ComputeStatusResponse, DispatchRequest, ErrorResponse, HealthResponse,
    RefreshTokenRequest, StartResponse, StopResponse, TaskAccepted, TaskResponse, TaskSubmission,
    WebhookEvent,
};
pub use signing::{
    sign, token_matches, AuthError, DispatchVerifier, SignedHeaders, NONCE_HEADER,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// Error codes carried in `ErrorResponse::error`.
pub mod error_codes {
    pub const AT_CAPACITY: &str = "at_capacity";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const ALREADY_EXISTS: &str = "already_exists";
    pub const NO_WORKER_AVAILABLE: &str = "no_worker_available";
    pub const INVALID_REQUEST: &str = "invalid_request";
}
