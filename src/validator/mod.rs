//! Token validation (spec section 4.1): format check, cache lookup,
//! store read, and the usage-tracking write, behind one trait so the
//! proxy handler never talks to a [`crate::store::TokenStore`] directly.

pub mod cache;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Why a token failed to validate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The bearer value isn't shaped like one of our secrets.
    #[error("malformed token")]
    InvalidFormat,

    /// No token matches this secret.
    #[error("token not found")]
    NotFound,

    /// The token (or its project) has been deactivated.
    #[error("token inactive")]
    Inactive,

    /// The token's `expires_at` has passed.
    #[error("token expired")]
    Expired,

    /// The token has exhausted its `max_requests` budget.
    #[error("token rate limited")]
    RateLimited,

    /// The store could not be reached.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<crate::store::StoreError> for ValidationError {
    fn from(err: crate::store::StoreError) -> Self {
        ValidationError::Storage(err.to_string())
    }
}

/// The identity a validated bearer token resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedToken {
    /// The token's own id, used for `increment_cache_hit`/usage bookkeeping.
    pub token_id: Uuid,
    /// The project the token authenticates as.
    pub project_id: Uuid,
}

/// Resolves a bearer token secret to the project id it authenticates,
/// optionally tracking usage against the token's request budget.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate without consuming request budget — used on the response
    /// cache hit path, which must not count against `max_requests`.
    async fn validate(&self, token_secret: &str) -> Result<ValidatedToken, ValidationError>;

    /// Validate and, on success, atomically increment the token's usage
    /// counter. This is the path taken for every cache-miss request.
    async fn validate_and_track(&self, token_secret: &str) -> Result<ValidatedToken, ValidationError>;

    /// Record a response-cache hit for `token_id`: increments
    /// `cache_hit_count`, never `request_count`. Called on the cache-hit
    /// fast path, which skips [`Self::validate_and_track`] entirely.
    async fn record_cache_hit(&self, token_id: Uuid) -> Result<(), ValidationError>;
}

/// The secret format this proxy issues: `sk-` followed by a non-empty
/// base64url body. Format rejection short-circuits before any store or
/// cache lookup.
pub fn looks_like_token_secret(secret: &str) -> bool {
    secret.len() > 3 && secret.starts_with("sk-")
}
