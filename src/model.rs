//! Core data model: projects, tokens, and the events the proxy emits.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant. Owns exactly one upstream API key, shared by all of its tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable identifier.
    pub id: Uuid,
    /// Display name, not used for routing or auth.
    pub name: String,
    /// The real upstream credential substituted in on every forwarded request.
    pub upstream_api_key: String,
    /// When `false`, every token under this project is rejected.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A short-lived, project-scoped bearer credential presented by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Stable identifier, distinct from `secret`.
    pub id: Uuid,
    /// The opaque, `sk-`-prefixed value clients present as a bearer token.
    pub secret: String,
    /// Owning project.
    pub project_id: Uuid,
    /// Absolute expiry; `None` means the token never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation flag, independent of expiry.
    pub is_active: bool,
    /// Requests admitted through the validator so far.
    pub request_count: u64,
    /// Upper bound on `request_count`; `None` means unbounded.
    pub max_requests: Option<u64>,
    /// Requests served from the response cache (does not count against `max_requests`).
    pub cache_hit_count: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time this token was presented, `None` if never used.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Generate a new opaque secret: `sk-` followed by a base64url-encoded
    /// UUIDv7 (time-ordered, so store indexes on `secret` stay roughly
    /// insertion-ordered without leaking a separate sequence column).
    pub fn generate_secret() -> String {
        let id = Uuid::now_v7();
        format!("sk-{}", URL_SAFE_NO_PAD.encode(id.as_bytes()))
    }

    /// The admission predicate from the data model: active, unexpired,
    /// and under budget. Does not consult the rate limiter or cache —
    /// those are separate, composed checks in the proxy handler.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return false;
            }
        }
        if let Some(max_requests) = self.max_requests {
            if self.request_count >= max_requests {
                return false;
            }
        }
        true
    }
}

/// An observability event emitted once per request exchange (or once
/// per significant internal condition, e.g. a rate-limiter fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Correlates with the `X-Request-Id` response header.
    pub request_id: Uuid,
    /// Project the request was authenticated against, if any.
    pub project_id: Option<Uuid>,
    /// Token that authenticated the request, if any.
    pub token_id: Option<Uuid>,
    /// Request method.
    pub method: String,
    /// Request path, as matched (not including query string).
    pub path: String,
    /// Response status code.
    pub status: u16,
    /// Whether the response was served from the response cache.
    pub cache_hit: bool,
    /// End-to-end handling duration, in milliseconds.
    pub duration_ms: u64,
    /// Size-capped inbound body, if captured.
    pub request_body: Option<Vec<u8>>,
    /// Size-capped outbound body, if captured.
    pub response_body: Option<Vec<u8>>,
    /// True when `response_body` was truncated at the capture cap.
    pub truncated: bool,
    /// Selected response headers captured for metadata extraction.
    pub response_headers: Vec<(String, String)>,
    /// When the event was produced.
    pub occurred_at: DateTime<Utc>,
    /// The durable bus's native message id, e.g. a Redis Stream entry id
    /// (`"1700000000000-0"`). `None` until a durable bus assigns one —
    /// always `None` on the in-memory bus, which assigns no log.
    pub log_id: Option<String>,
}

/// The shape handed to a [`crate::dispatcher::plugin::BackendPlugin`],
/// produced from an [`Event`] by [`crate::dispatcher::transform`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    /// Same correlation id as the source event.
    pub request_id: Uuid,
    /// Project the request was authenticated against, if any.
    pub project_id: Option<Uuid>,
    /// Token that authenticated the request, if any.
    pub token_id: Option<Uuid>,
    /// Request method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Response status code.
    pub status: u16,
    /// Whether the response was served from the response cache.
    pub cache_hit: bool,
    /// End-to-end handling duration, in milliseconds.
    pub duration_ms: u64,
    /// Best-effort upstream model identifier, when extractable.
    pub model: Option<String>,
    /// Best-effort prompt token count, when extractable.
    pub prompt_tokens: Option<u64>,
    /// Best-effort completion token count, when extractable.
    pub completion_tokens: Option<u64>,
    /// Best-effort total token count, when extractable.
    pub total_tokens: Option<u64>,
    /// Decoded response body text, when decode succeeded and fit the cap.
    pub response_text: Option<String>,
    /// When the source event was produced.
    pub occurred_at: DateTime<Utc>,
    /// The durable bus's native message id carried through from the
    /// source event, if the bus that delivered it assigned one.
    pub log_id: Option<String>,
}

/// A response cached under a fingerprint, ready to be replayed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Status code to replay.
    pub status: u16,
    /// Headers to replay, excluding hop-by-hop and cache-control headers.
    pub headers: Vec<(String, String)>,
    /// Body bytes, stored exactly as received from upstream.
    pub body: Vec<u8>,
    /// When this entry was stored.
    pub cached_at: DateTime<Utc>,
    /// When this entry should no longer be served.
    pub expires_at: DateTime<Utc>,
}

impl CachedResponse {
    /// Whether this entry is still servable at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> Token {
        Token {
            id: Uuid::now_v7(),
            secret: Token::generate_secret(),
            project_id: Uuid::now_v7(),
            expires_at: None,
            is_active: true,
            request_count: 0,
            max_requests: None,
            cache_hit_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn generated_secrets_carry_the_expected_prefix() {
        let secret = Token::generate_secret();
        assert!(secret.starts_with("sk-"));
        assert!(secret.len() > 10);
    }

    #[test]
    fn a_fresh_unbounded_token_is_valid() {
        assert!(sample_token().is_valid(Utc::now()));
    }

    #[test]
    fn an_inactive_token_is_never_valid() {
        let mut token = sample_token();
        token.is_active = false;
        assert!(!token.is_valid(Utc::now()));
    }

    #[test]
    fn an_expired_token_is_invalid() {
        let mut token = sample_token();
        token.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!token.is_valid(Utc::now()));
    }

    #[test]
    fn a_token_at_its_request_budget_is_invalid() {
        let mut token = sample_token();
        token.max_requests = Some(5);
        token.request_count = 5;
        assert!(!token.is_valid(Utc::now()));
    }

    #[test]
    fn cached_response_freshness_respects_expiry() {
        let now = Utc::now();
        let response = CachedResponse {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            cached_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        };
        assert!(response.is_fresh(now));
        assert!(!response.is_fresh(now + chrono::Duration::seconds(31)));
    }
}
