//! In-process fixed-window rate limiter, sharded by `dashmap` the way
//! the teacher's own rate limiter shards its token-bucket state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use super::{decide, Decision, RateLimiter, WindowState};

/// A single-process rate limiter. Each key gets its own window state in
/// a sharded map; correctness only needs the per-entry read-modify-write
/// dashmap's `entry` API already gives us.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    windows: DashMap<String, WindowState>,
}

impl InMemoryRateLimiter {
    /// An empty limiter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(&self, key: &str, limit: u64, window: Duration, now: DateTime<Utc>) -> Decision {
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| WindowState {
            window_start: super::window_boundary(now, window),
            count: 0,
        });
        decide(&mut entry, limit, window, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_keys_have_independent_budgets() {
        let limiter = InMemoryRateLimiter::new();
        let window = Duration::from_secs(60);
        let now = Utc::now();

        assert!(matches!(
            limiter.allow("token-a", 1, window, now).await,
            Decision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.allow("token-b", 1, window, now).await,
            Decision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.allow("token-a", 1, window, now).await,
            Decision::Denied { .. }
        ));
    }
}
