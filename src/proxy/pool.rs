//! Upstream connection pool construction (spec section 4.4/6): one
//! `reqwest::Client` per process, shared across every inbound request,
//! sized from [`crate::config::PoolConfig`].
//!
//! Grounded on the teacher's `api::gateway::GatewayConfig` tunables
//! (`request_timeout`, retry/backoff shapes) generalized to the
//! connection-pool knobs spec section 6 actually names.

use crate::config::PoolConfig;

/// Build the shared upstream HTTP client. Built once at startup and
/// held for the process lifetime — the pool is a deliberate global
/// singleton tied to server lifecycle, not ambient state (spec section 9).
pub fn build_client(pool: &PoolConfig, request_timeout: std::time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool.max_idle_conns_per_host)
        .pool_idle_timeout(pool.idle_conn_timeout)
        .timeout(request_timeout)
        .build()
}
