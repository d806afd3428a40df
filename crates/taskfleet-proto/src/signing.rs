//! Signed dispatch envelopes.
//!
//! A request carries three headers next to its JSON body:
//! - `x-dispatch-timestamp`: unix milliseconds at signing time
//! - `x-dispatch-nonce`: a fresh UUID per attempt
//! - `x-dispatch-signature`: hex HMAC-SHA256 over
//!   `"{timestamp}.{nonce}.{canonical_json(body)}"`
//!
//! Receivers check the signature first, then the timestamp window, then the
//! nonce. A nonce is remembered only until its window closes.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::canonical_json;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-dispatch-timestamp";
pub const SIGNATURE_HEADER: &str = "x-dispatch-signature";
pub const NONCE_HEADER: &str = "x-dispatch-nonce";

/// Default validity window for a signed request: five minutes either side.
pub const DEFAULT_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Reasons a signed request is rejected. All map to 401.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("malformed timestamp")]
    MalformedTimestamp,

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("timestamp outside validity window")]
    Expired,

    #[error("nonce already used")]
    Replayed,
}

/// The three envelope headers of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp_ms: i64,
    pub nonce: String,
    pub signature: String,
}

impl SignedHeaders {
    /// Sign `payload` now with a fresh nonce.
    pub fn sign(secret: &str, payload: &Value) -> Self {
        Self::sign_at(secret, payload, Utc::now().timestamp_millis(), Uuid::new_v4().to_string())
    }

    /// Sign `payload` with an explicit timestamp and nonce.
    pub fn sign_at(secret: &str, payload: &Value, timestamp_ms: i64, nonce: String) -> Self {
        let signature = sign(secret, timestamp_ms, &nonce, payload);
        Self {
            timestamp_ms,
            nonce,
            signature,
        }
    }

    /// Read the envelope headers through a lookup function.
    ///
    /// Kept independent of any HTTP crate; callers pass e.g.
    /// `|name| headers.get(name).and_then(|v| v.to_str().ok())`.
    pub fn from_lookup<'a, F>(lookup: F) -> Result<Self, AuthError>
    where
        F: Fn(&'static str) -> Option<&'a str>,
    {
        let timestamp = lookup(TIMESTAMP_HEADER).ok_or(AuthError::MissingHeader(TIMESTAMP_HEADER))?;
        let nonce = lookup(NONCE_HEADER).ok_or(AuthError::MissingHeader(NONCE_HEADER))?;
        let signature = lookup(SIGNATURE_HEADER).ok_or(AuthError::MissingHeader(SIGNATURE_HEADER))?;

        if nonce.is_empty() {
            return Err(AuthError::MissingHeader(NONCE_HEADER));
        }

        let timestamp_ms = timestamp
            .trim()
            .parse::<i64>()
            .map_err(|_| AuthError::MalformedTimestamp)?;

        Ok(Self {
            timestamp_ms,
            nonce: nonce.to_string(),
            signature: signature.trim().to_string(),
        })
    }

    /// Header name/value pairs, ready to attach to an outgoing request.
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            (TIMESTAMP_HEADER, self.timestamp_ms.to_string()),
            (NONCE_HEADER, self.nonce.clone()),
            (SIGNATURE_HEADER, self.signature.clone()),
        ]
    }
}

fn signing_input(timestamp_ms: i64, nonce: &str, payload: &Value) -> String {
    format!("{}.{}.{}", timestamp_ms, nonce, canonical_json(payload))
}

fn mac_for(secret: &str) -> HmacSha256 {
    // HMAC takes keys of any length.
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any size"),
    }
}

/// Hex HMAC-SHA256 signature for one request.
pub fn sign(secret: &str, timestamp_ms: i64, nonce: &str, payload: &Value) -> String {
    let mut mac = mac_for(secret);
    mac.update(signing_input(timestamp_ms, nonce, payload).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check. Ignores timestamp and nonce freshness.
pub fn verify_signature(secret: &str, headers: &SignedHeaders, payload: &Value) -> Result<(), AuthError> {
    let provided = hex::decode(&headers.signature).map_err(|_| AuthError::InvalidSignature)?;

    let mut mac = mac_for(secret);
    mac.update(signing_input(headers.timestamp_ms, &headers.nonce, payload).as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| AuthError::InvalidSignature)
}

/// Constant-time bearer token check. An empty `expected` never matches.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    // Both sides are reduced to fixed-size tags so the length of
    // `presented` does not show in the timing either.
    let mut expected_mac = mac_for(BEARER_KEY);
    expected_mac.update(expected.as_bytes());
    let expected_tag = expected_mac.finalize().into_bytes();

    let mut mac = mac_for(BEARER_KEY);
    mac.update(presented.as_bytes());
    mac.verify_slice(&expected_tag).is_ok()
}

const BEARER_KEY: &str = "taskfleet-bearer";

/// Nonces seen within the validity window, with their expiry.
#[derive(Debug, Default)]
struct NonceCache {
    expires_at_ms: HashMap<String, i64>,
}

impl NonceCache {
    /// Record `nonce`; false if it was already live.
    fn insert(&mut self, nonce: &str, now_ms: i64, expires_at_ms: i64) -> bool {
        self.expires_at_ms.retain(|_, exp| *exp > now_ms);
        if self.expires_at_ms.contains_key(nonce) {
            return false;
        }
        self.expires_at_ms.insert(nonce.to_string(), expires_at_ms);
        true
    }

    fn len(&self) -> usize {
        self.expires_at_ms.len()
    }
}

/// Receiver-side validation of signed requests with replay protection.
#[derive(Debug)]
pub struct DispatchVerifier {
    secret: String,
    window_ms: i64,
    nonces: Mutex<NonceCache>,
}

impl DispatchVerifier {
    /// Create a verifier with the default five minute window.
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_window(secret, DEFAULT_WINDOW_MS)
    }

    /// Create a verifier with a custom window.
    pub fn with_window(secret: impl Into<String>, window_ms: i64) -> Self {
        Self {
            secret: secret.into(),
            window_ms,
            nonces: Mutex::new(NonceCache::default()),
        }
    }

    /// Validate a request against the current wall clock.
    pub fn verify(&self, headers: &SignedHeaders, payload: &Value) -> Result<(), AuthError> {
        self.verify_at(headers, payload, Utc::now().timestamp_millis())
    }

    /// Validate a request as of `now_ms`.
    pub fn verify_at(&self, headers: &SignedHeaders, payload: &Value, now_ms: i64) -> Result<(), AuthError> {
        self.check(&self.secret, headers, payload, now_ms)
    }

    /// Validate a request signed with a per-request secret (e.g. a task's
    /// webhook secret), sharing this verifier's window and nonce cache.
    pub fn verify_with_secret(&self, secret: &str, headers: &SignedHeaders, payload: &Value) -> Result<(), AuthError> {
        self.check(secret, headers, payload, Utc::now().timestamp_millis())
    }

    fn check(&self, secret: &str, headers: &SignedHeaders, payload: &Value, now_ms: i64) -> Result<(), AuthError> {
        verify_signature(secret, headers, payload)?;

        if (now_ms - headers.timestamp_ms).abs() > self.window_ms {
            return Err(AuthError::Expired);
        }

        // The nonce must outlive every timestamp the window still accepts.
        let expires_at_ms = headers.timestamp_ms + self.window_ms;
        let mut nonces = self.nonces.lock().unwrap_or_else(|e| e.into_inner());
        if !nonces.insert(&headers.nonce, now_ms, expires_at_ms) {
            return Err(AuthError::Replayed);
        }

        Ok(())
    }

    /// Number of nonces currently remembered.
    pub fn tracked_nonces(&self) -> usize {
        self.nonces.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
