//! `llm-dispatcherd`: the event-dispatcher binary.
//!
//! Connects to the same event bus the proxy publishes to, drains it in
//! batches, and delivers each batch to one configured backend plugin
//! with retry. Runs until a shutdown signal arrives, flushing whatever
//! batch is in flight before exiting.

use std::path::PathBuf;
use std::sync::Arc;

use llm_proxy::bus::memory::InMemoryBus;
use llm_proxy::bus::streams::RedisStreamsBus;
use llm_proxy::bus::Bus;
use llm_proxy::config::{DispatcherConfig, EventBusKind};
use llm_proxy::dispatcher::DispatcherService;
use llm_proxy::telemetry::{self, LogFormat};

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

    let config = load_dispatcher_config()?;
    tracing::info!(service = ?config.service, batch_size = config.batch_size, "starting llm-dispatcherd");

    let event_bus_kind = if config.streams.stream_key.is_empty() {
        EventBusKind::InMemory
    } else {
        EventBusKind::Streams
    };

    let bus = Arc::new(build_bus(event_bus_kind, &config).await?);
    let dispatcher = DispatcherService::new(bus, config).map_err(|e| anyhow::anyhow!("failed to build dispatcher: {e}"))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await;

    let metrics = dispatcher.metrics();
    tracing::info!(
        processed = metrics.processed.load(std::sync::atomic::Ordering::Relaxed),
        sent = metrics.sent.load(std::sync::atomic::Ordering::Relaxed),
        dropped = metrics.dropped.load(std::sync::atomic::Ordering::Relaxed),
        "llm-dispatcherd shut down cleanly"
    );
    Ok(())
}

fn load_dispatcher_config() -> anyhow::Result<DispatcherConfig> {
    let path = std::env::var("DISPATCHER_CONFIG_PATH").ok().map(PathBuf::from);
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
            toml::from_str(&contents).map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))
        }
        None => Ok(DispatcherConfig::default()),
    }
}

async fn build_bus(kind: EventBusKind, config: &DispatcherConfig) -> anyhow::Result<Bus> {
    match kind {
        EventBusKind::InMemory => Ok(Bus::InMemory(Arc::new(InMemoryBus::new()))),
        EventBusKind::Streams => {
            let client = redis::Client::open(config.streams.redis_url.as_str())
                .map_err(|e| anyhow::anyhow!("invalid redis_url: {e}"))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to redis: {e}"))?;
            let streams_bus = RedisStreamsBus::new(manager, config.streams.clone());
            streams_bus
                .ensure_group()
                .await
                .map_err(|e| anyhow::anyhow!("failed to create consumer group: {e}"))?;
            Ok(Bus::Streams(Arc::new(streams_bus)))
        }
    }
}

async fn wait_for_shutdown_signal() {
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
