//! Redis-backed rate limiter for multi-instance deployments, with
//! fallback to an in-process limiter on Redis error (grounded on the
//! teacher's `redis::cmd(...).arg(...)` call style, used throughout its
//! queue/scheduling module).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

use super::{memory::InMemoryRateLimiter, Decision, RateLimiter};

/// Coordinates a shared rate-limit budget across proxy instances via
/// Redis `INCR`/`EXPIRE`, falling back to a local, per-instance limiter
/// whenever Redis is unreachable so a Redis outage degrades rate
/// limiting rather than failing every request closed.
pub struct DistributedRateLimiter {
    redis: ConnectionManager,
    fallback: Arc<InMemoryRateLimiter>,
}

impl DistributedRateLimiter {
    /// Build a limiter over an already-connected Redis connection manager.
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            fallback: Arc::new(InMemoryRateLimiter::new()),
        }
    }

    async fn allow_via_redis(&self, key: &str, limit: u64, window: Duration, now: DateTime<Utc>) -> redis::RedisResult<Decision> {
        let mut conn = self.redis.clone();
        let bucket = super::window_boundary(now, window).timestamp();
        let redis_key = format!("llm-proxy:ratelimit:{key}:{bucket}");

        let count: u64 = redis::cmd("INCR").arg(&redis_key).query_async(&mut conn).await?;

        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&redis_key)
                .arg(window.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
        }

        let reset_at = super::window_boundary(now, window) + chrono::Duration::from_std(window).unwrap_or_default();

        if count > limit {
            let retry_after = (reset_at - now).num_seconds().max(0) as u64;
            Ok(Decision::Denied { retry_after, limit })
        } else {
            Ok(Decision::Allowed {
                remaining: limit - count,
                reset_at,
            })
        }
    }
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    async fn allow(&self, key: &str, limit: u64, window: Duration, now: DateTime<Utc>) -> Decision {
        match self.allow_via_redis(key, limit, window, now).await {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(%error, "rate limiter falling back to in-memory window; redis unreachable");
                self.fallback.allow(key, limit, window, now).await
            }
        }
    }
}
