//! Authentication collaborator and connection rate limiting.
//!
//! Credentials are checked once, during the HTTP upgrade. Everything after
//! that trusts the `owner_id` the authenticator returned.

pub mod rate_limit;

pub use rate_limit::{RateLimiter, ServerRateLimits};

use termrelay_core::{issue_token, verify_token, RelayError, RelayResult};

/// Validates a bearer credential and yields the owner it belongs to.
pub trait Authenticator: Send + Sync {
    fn validate(&self, token: &str) -> RelayResult<String>;
}

/// HMAC-signed bearer tokens.
pub struct TokenAuthenticator {
    secret: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Mint a token for `owner_id`.
    pub fn issue(&self, owner_id: &str, ttl_secs: u64) -> RelayResult<String> {
        issue_token(&self.secret, owner_id, ttl_secs)
    }
}

impl Authenticator for TokenAuthenticator {
    fn validate(&self, token: &str) -> RelayResult<String> {
        verify_token(&self.secret, token).map_err(|e| match e {
            RelayError::Token(msg) => RelayError::AuthFailed(msg),
            other => other,
        })
    }
}
