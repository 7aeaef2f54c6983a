//! `llm-proxyd`: the reverse-proxy binary.
//!
//! Loads configuration, constructs the shared [`llm_proxy::proxy::AppState`],
//! wires the axum router, and serves until a shutdown signal arrives.
//! Fatal initialization errors (bad config, an unparseable `RUST_LOG`
//! filter) exit non-zero rather than starting in a half-working state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use llm_proxy::bus::memory::InMemoryBus;
use llm_proxy::bus::streams::RedisStreamsBus;
use llm_proxy::bus::Bus;
use llm_proxy::config::{EventBusKind, ProxyConfig};
use llm_proxy::proxy::handler::proxy_handler;
use llm_proxy::proxy::whitelist::ParamWhitelist;
use llm_proxy::proxy::{cors, pool, AppState};
use llm_proxy::ratelimit::distributed::DistributedRateLimiter;
use llm_proxy::ratelimit::memory::InMemoryRateLimiter;
use llm_proxy::ratelimit::RateLimiter;
use llm_proxy::respcache::ResponseCache;
use llm_proxy::store::memory::{InMemoryProjectStore, InMemoryTokenStore};
use llm_proxy::telemetry::{self, LogFormat};
use llm_proxy::validator::cache::CachedValidator;
use llm_proxy::validator::TokenValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = std::env::var("PROXY_LOG_FORMAT")
        .ok()
        .and_then(|v| match v.as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" => Some(LogFormat::Pretty),
            _ => None,
        })
        .unwrap_or_default();
    telemetry::init_tracing(log_format).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config_path = std::env::var("PROXY_CONFIG_PATH").ok().map(PathBuf::from);
    let config = ProxyConfig::from_env_and_file(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    tracing::info!(listen_addr = %config.listen_addr, providers = config.providers.len(), "starting llm-proxyd");

    let state = build_app_state(config.clone()).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {e}", config.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    tracing::info!("llm-proxyd shut down cleanly");
    Ok(())
}

async fn build_app_state(config: ProxyConfig) -> anyhow::Result<Arc<AppState>> {
    let config = Arc::new(config);

    let token_store = Arc::new(InMemoryTokenStore::new());
    let project_store = Arc::new(InMemoryProjectStore::new());
    let validator: Arc<dyn TokenValidator> = Arc::new(CachedValidator::new(token_store));

    let rate_limiter: Arc<dyn RateLimiter> = match config.event_bus {
        EventBusKind::Streams => {
            let client = redis::Client::open(config.streams.redis_url.as_str())
                .map_err(|e| anyhow::anyhow!("invalid redis_url: {e}"))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to redis: {e}"))?;
            Arc::new(DistributedRateLimiter::new(manager))
        }
        EventBusKind::InMemory => Arc::new(InMemoryRateLimiter::new()),
    };

    let bus = Arc::new(build_bus(&config).await?);

    let response_cache = Arc::new(ResponseCache::new(config.cache.cache_max_entries, config.cache.cache_default_ttl));

    let param_whitelist = Arc::new(
        ParamWhitelist::compile(&config.param_whitelist).map_err(|e| anyhow::anyhow!("invalid param_whitelist config: {e}"))?,
    );

    let http_client = pool::build_client(&config.pool, config.request_timeout)
        .map_err(|e| anyhow::anyhow!("failed to build upstream HTTP client: {e}"))?;

    Ok(Arc::new(AppState {
        config,
        validator,
        project_store,
        rate_limiter,
        response_cache,
        bus,
        http_client,
        param_whitelist,
    }))
}

async fn build_bus(config: &ProxyConfig) -> anyhow::Result<Bus> {
    match config.event_bus {
        EventBusKind::InMemory => Ok(Bus::InMemory(Arc::new(InMemoryBus::new()))),
        EventBusKind::Streams => {
            let client = redis::Client::open(config.streams.redis_url.as_str())
                .map_err(|e| anyhow::anyhow!("invalid redis_url: {e}"))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to redis: {e}"))?;
            let streams_bus = RedisStreamsBus::new(manager, config.streams.clone());
            streams_bus.ensure_group().await.map_err(|e| anyhow::anyhow!("failed to create consumer group: {e}"))?;
            Ok(Bus::Streams(Arc::new(streams_bus)))
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/*path", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(cors::build(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.request_timeout + Duration::from_secs(5)))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
