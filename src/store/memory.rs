//! In-memory `TokenStore`/`ProjectStore` doubles used by this crate's
//! own test suite and by local development without a management-plane
//! database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{Project, Token};

use super::{ProjectStore, StoreError, TokenStore, UsageUpdate};

/// An in-memory [`TokenStore`] keyed by both token id and secret.
#[derive(Default)]
pub struct InMemoryTokenStore {
    by_secret: RwLock<HashMap<String, Uuid>>,
    by_id: RwLock<HashMap<Uuid, Token>>,
}

impl InMemoryTokenStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a token.
    pub fn insert(&self, token: Token) {
        self.by_secret.write().insert(token.secret.clone(), token.id);
        self.by_id.write().insert(token.id, token);
    }

    /// Snapshot the current state of a token, if present.
    pub fn get(&self, id: Uuid) -> Option<Token> {
        self.by_id.read().get(&id).cloned()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get_by_secret(&self, secret: &str) -> Result<Option<Token>, StoreError> {
        let id = match self.by_secret.read().get(secret).copied() {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(self.by_id.read().get(&id).cloned())
    }

    async fn increment_usage(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<UsageUpdate, StoreError> {
        let mut guard = self.by_id.write();
        let token = match guard.get_mut(&token_id) {
            Some(token) => token,
            None => return Ok(UsageUpdate::NoRowsAffected),
        };

        if !token.is_valid(now) {
            return Ok(UsageUpdate::NoRowsAffected);
        }

        token.request_count += 1;
        token.last_used_at = Some(now);
        Ok(UsageUpdate::Incremented)
    }

    async fn increment_cache_hit(&self, token_id: Uuid) -> Result<(), StoreError> {
        if let Some(token) = self.by_id.write().get_mut(&token_id) {
            token.cache_hit_count += 1;
        }
        Ok(())
    }
}

/// An in-memory [`ProjectStore`] keyed by project id.
#[derive(Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<Uuid, Project>>,
}

impl InMemoryProjectStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a project.
    pub fn insert(&self, project: Project) {
        self.projects.write().insert(project.id, project);
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn get(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.read().get(&project_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_token(project_id: Uuid) -> Token {
        Token {
            id: Uuid::now_v7(),
            secret: Token::generate_secret(),
            project_id,
            expires_at: None,
            is_active: true,
            request_count: 0,
            max_requests: Some(2),
            cache_hit_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn increment_usage_stops_at_the_request_budget() {
        let store = InMemoryTokenStore::new();
        let token = new_token(Uuid::now_v7());
        let id = token.id;
        store.insert(token);

        assert_eq!(
            store.increment_usage(id, Utc::now()).await.unwrap(),
            UsageUpdate::Incremented
        );
        assert_eq!(
            store.increment_usage(id, Utc::now()).await.unwrap(),
            UsageUpdate::Incremented
        );
        assert_eq!(
            store.increment_usage(id, Utc::now()).await.unwrap(),
            UsageUpdate::NoRowsAffected
        );
    }

    #[tokio::test]
    async fn increment_usage_on_an_unknown_token_is_a_no_op_not_an_error() {
        let store = InMemoryTokenStore::new();
        assert_eq!(
            store.increment_usage(Uuid::now_v7(), Utc::now()).await.unwrap(),
            UsageUpdate::NoRowsAffected
        );
    }

    #[tokio::test]
    async fn cache_hits_never_touch_request_count() {
        let store = InMemoryTokenStore::new();
        let token = new_token(Uuid::now_v7());
        let id = token.id;
        store.insert(token);

        store.increment_cache_hit(id).await.unwrap();
        store.increment_cache_hit(id).await.unwrap();

        let snapshot = store.get(id).unwrap();
        assert_eq!(snapshot.cache_hit_count, 2);
        assert_eq!(snapshot.request_count, 0);
    }
}
