//! `CachedValidator`: a bounded, TTL'd front for any [`TokenStore`].
//!
//! Grounded on the teacher's reader/writer-locked map idiom (seen across
//! its enterprise auth/cache modules): a `parking_lot::RwLock` guards a
//! `HashMap`, insertion order tracked in a side `VecDeque` for FIFO
//! eviction once the cap is hit, and a background task periodically
//! sweeps TTL-expired entries so a cold, unused entry doesn't linger
//! forever between lookups.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::store::{StoreError, TokenStore, UsageUpdate};

use super::{looks_like_token_secret, TokenValidator, ValidatedToken, ValidationError};

#[derive(Clone, Copy)]
struct CacheEntry {
    token_id: Uuid,
    project_id: Uuid,
    inserted_at: Instant,
}

struct Cache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, secret: String, entry: CacheEntry) {
        if !self.entries.contains_key(&secret) {
            self.order.push_back(secret.clone());
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(secret, entry);
    }

    fn remove(&mut self, secret: &str) {
        self.entries.remove(secret);
    }

    fn sweep(&mut self, ttl: Duration, now: Instant) {
        self.entries.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
        self.order.retain(|secret| self.entries.contains_key(secret));
    }
}

/// A `TokenValidator` wrapping a [`TokenStore`] with a bounded FIFO/TTL cache.
pub struct CachedValidator<S> {
    store: Arc<S>,
    cache: Arc<RwLock<Cache>>,
    ttl: Duration,
}

impl<S: TokenStore + 'static> CachedValidator<S> {
    /// Default cache capacity (spec: `N` = 1000).
    pub const DEFAULT_CAPACITY: usize = 1000;
    /// Default entry time-to-live (spec: `T` = 5 minutes).
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    /// Build a validator with the default capacity/TTL and spawn its
    /// background sweep task.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_capacity_and_ttl(store, Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }

    /// Build a validator with explicit cache tuning.
    pub fn with_capacity_and_ttl(store: Arc<S>, capacity: usize, ttl: Duration) -> Self {
        let cache = Arc::new(RwLock::new(Cache::new(capacity)));

        let sweep_cache = Arc::clone(&cache);
        let sweep_ttl = ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_ttl.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                sweep_cache.write().sweep(sweep_ttl, Instant::now());
            }
        });

        Self { store, cache, ttl }
    }

    /// Best-effort cache invalidation, e.g. after an out-of-band revoke
    /// notification. A concurrent reader may still observe one more
    /// cached hit before this takes effect.
    pub fn invalidate(&self, token_secret: &str) {
        self.cache.write().remove(token_secret);
    }

    async fn resolve(&self, token_secret: &str) -> Result<ValidatedToken, ValidationError> {
        if !looks_like_token_secret(token_secret) {
            return Err(ValidationError::InvalidFormat);
        }

        if let Some(entry) = self.cache.read().entries.get(token_secret).copied() {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(ValidatedToken {
                    token_id: entry.token_id,
                    project_id: entry.project_id,
                });
            }
        }

        let token = self
            .store
            .get_by_secret(token_secret)
            .await?
            .ok_or(ValidationError::NotFound)?;

        classify_token_state(&token, Utc::now())?;

        self.cache.write().insert(
            token_secret.to_string(),
            CacheEntry {
                token_id: token.id,
                project_id: token.project_id,
                inserted_at: Instant::now(),
            },
        );

        Ok(ValidatedToken {
            token_id: token.id,
            project_id: token.project_id,
        })
    }
}

/// Maps a token's own validity predicate onto the specific
/// `ValidationError` variant the caller should see.
fn classify_token_state(token: &crate::model::Token, now: chrono::DateTime<Utc>) -> Result<(), ValidationError> {
    if !token.is_active {
        return Err(ValidationError::Inactive);
    }
    if let Some(expires_at) = token.expires_at {
        if now >= expires_at {
            return Err(ValidationError::Expired);
        }
    }
    if let Some(max_requests) = token.max_requests {
        if token.request_count >= max_requests {
            return Err(ValidationError::RateLimited);
        }
    }
    Ok(())
}

#[async_trait]
impl<S: TokenStore + 'static> TokenValidator for CachedValidator<S> {
    async fn validate(&self, token_secret: &str) -> Result<ValidatedToken, ValidationError> {
        self.resolve(token_secret).await
    }

    async fn validate_and_track(&self, token_secret: &str) -> Result<ValidatedToken, ValidationError> {
        let validated = self.resolve(token_secret).await?;

        match self.store.increment_usage(validated.token_id, Utc::now()).await? {
            UsageUpdate::Incremented => Ok(validated),
            UsageUpdate::NoRowsAffected => {
                self.cache.write().remove(token_secret);
                let token = self
                    .store
                    .get_by_secret(token_secret)
                    .await?
                    .ok_or(ValidationError::NotFound)?;
                classify_token_state(&token, Utc::now())?;
                // The token looked valid on re-read yet the conditional
                // update still matched nothing; treat as a transient
                // store race rather than fabricate a wrong classification.
                Err(ValidationError::Storage(
                    "usage update matched no rows on a token that re-reads as valid".to_string(),
                ))
            }
        }
    }

    async fn record_cache_hit(&self, token_id: Uuid) -> Result<(), ValidationError> {
        self.store.increment_cache_hit(token_id).await?;
        Ok(())
    }
}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationError::Storage(err.to_string())
    }
}
