//! Request-rate limiting (spec section 4.2): a fixed window per key,
//! either held in-process or coordinated through Redis for multi-instance
//! deployments.

pub mod distributed;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The outcome of a single [`RateLimiter::allow`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is admitted.
    Allowed {
        /// Requests remaining in the current window after this one.
        remaining: u64,
        /// When the current window resets.
        reset_at: DateTime<Utc>,
    },
    /// The request is rejected.
    Denied {
        /// Seconds the caller should wait before retrying.
        retry_after: u64,
        /// The configured limit that was exceeded.
        limit: u64,
    },
}

/// A fixed-window rate limiter keyed by an arbitrary string (a token id,
/// in this crate's usage).
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check and, if admitted, consume one unit of budget for `key`'s
    /// current window.
    async fn allow(&self, key: &str, limit: u64, window: std::time::Duration, now: DateTime<Utc>) -> Decision;
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: DateTime<Utc>,
    count: u64,
}

fn window_boundary(now: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
    let window_secs = window.as_secs().max(1) as i64;
    let epoch_secs = now.timestamp();
    let boundary_secs = (epoch_secs / window_secs) * window_secs;
    DateTime::from_timestamp(boundary_secs, 0).unwrap_or(now)
}

fn decide(state: &mut WindowState, limit: u64, window: std::time::Duration, now: DateTime<Utc>) -> Decision {
    let current_boundary = window_boundary(now, window);
    if state.window_start < current_boundary {
        state.window_start = current_boundary;
        state.count = 0;
    }

    if state.count >= limit {
        let reset_at = state.window_start + chrono::Duration::from_std(window).unwrap_or_default();
        let retry_after = (reset_at - now).num_seconds().max(0) as u64;
        return Decision::Denied { retry_after, limit };
    }

    state.count += 1;
    let reset_at = state.window_start + chrono::Duration::from_std(window).unwrap_or_default();
    Decision::Allowed {
        remaining: limit - state.count,
        reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_boundary_is_stable_within_a_window() {
        let window = std::time::Duration::from_secs(60);
        let now = Utc::now();
        let a = window_boundary(now, window);
        let b = window_boundary(now + chrono::Duration::seconds(1), window);
        assert_eq!(a, b);
    }

    #[test]
    fn decide_denies_once_the_limit_is_reached() {
        let mut state = WindowState {
            window_start: window_boundary(Utc::now(), std::time::Duration::from_secs(60)),
            count: 0,
        };
        let window = std::time::Duration::from_secs(60);
        let now = Utc::now();

        assert!(matches!(decide(&mut state, 2, window, now), Decision::Allowed { .. }));
        assert!(matches!(decide(&mut state, 2, window, now), Decision::Allowed { .. }));
        assert!(matches!(decide(&mut state, 2, window, now), Decision::Denied { .. }));
    }

    #[test]
    fn decide_resets_once_the_window_advances() {
        let window = std::time::Duration::from_secs(1);
        let now = Utc::now();
        let mut state = WindowState {
            window_start: window_boundary(now, window),
            count: 1,
        };
        let later = now + chrono::Duration::seconds(2);
        assert!(matches!(decide(&mut state, 1, window, later), Decision::Allowed { .. }));
    }
}
