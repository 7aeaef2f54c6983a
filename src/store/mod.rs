//! Storage traits the core consumes but never implements beyond a test
//! double — a real implementation (Postgres-backed, most likely) lives
//! in the management plane, out of scope for this crate.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Project, Token};

/// Errors a store implementation may report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is unreachable (connection refused, timeout, pool exhausted).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store reported a failure not covered by the other variants.
    #[error("store error: {0}")]
    Other(String),
}

/// The outcome of [`TokenStore::increment_usage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUpdate {
    /// The conditional update applied; the token had budget remaining.
    Incremented,
    /// Zero rows matched the conditional update. The caller must re-read
    /// the token to classify why (revoked, expired, or rate-limited by
    /// `max_requests` concurrently).
    NoRowsAffected,
}

/// Token lookups and the single atomic usage-tracking write the
/// validator performs on every tracked admission.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Look up a token by its opaque secret. `None` means no such token exists.
    async fn get_by_secret(&self, secret: &str) -> Result<Option<Token>, StoreError>;

    /// Atomically increment `request_count` and set `last_used_at = now`,
    /// but only when the token is still active, unexpired, and under its
    /// request budget. This is the single conditional `UPDATE` described
    /// by the spec; a zero-row result means the caller must re-read to
    /// classify why admission was denied.
    async fn increment_usage(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<UsageUpdate, StoreError>;

    /// Increment `cache_hit_count` for a token served from the response cache.
    /// Never affects `request_count` or rate-limit state.
    async fn increment_cache_hit(&self, token_id: Uuid) -> Result<(), StoreError>;
}

/// Project lookups. The core never mutates a project.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Look up a project by id. `None` means no such project exists.
    async fn get(&self, project_id: Uuid) -> Result<Option<Project>, StoreError>;
}
