//! The dispatcher service (spec section 5, component C8): reads event
//! batches off the bus, transforms them, and delivers them to a
//! [`plugin::BackendPlugin`] with bounded retry and exponential
//! backoff, acknowledging the batch only once delivery succeeds (or is
//! permanently given up on).
//!
//! Grounded on the teacher's `api::webhooks::WebhookManager::deliver_to_webhook`
//! retry loop (attempt, classify, backoff, re-attempt up to a max) and
//! its `enterprise::eventsource` consumer-group read loop for the
//! bus-draining half.

pub mod plugin;
pub mod transform;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::{AckToken, Bus};
use crate::config::{DispatcherConfig, PluginKind};
use plugin::BackendPlugin;

/// Running totals exposed for operational visibility (spec section 5.5).
#[derive(Default)]
pub struct DispatcherMetrics {
    /// Events read off the bus, regardless of outcome.
    pub processed: AtomicU64,
    /// Events dropped after exhausting retries against a transient failure.
    pub dropped: AtomicU64,
    /// Events successfully delivered.
    pub sent: AtomicU64,
}

/// Drains an [`EventBus`], batching, transforming, and delivering
/// events to one configured [`BackendPlugin`].
pub struct DispatcherService {
    bus: Arc<Bus>,
    plugin: Arc<dyn BackendPlugin>,
    plugin_kind: PluginKind,
    config: DispatcherConfig,
    metrics: Arc<DispatcherMetrics>,
}

impl DispatcherService {
    /// Build a dispatcher for the configured plugin. Does not start
    /// running until [`Self::run`] is awaited.
    pub fn new(bus: Arc<Bus>, config: DispatcherConfig) -> Result<Self, plugin::PluginError> {
        let plugin = plugin::build(config.service, &config.plugin_settings)?;
        Ok(Self {
            bus,
            plugin,
            plugin_kind: config.service,
            config,
            metrics: Arc::new(DispatcherMetrics::default()),
        })
    }

    /// A cloneable handle to this dispatcher's running counters.
    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `shutdown` resolves, then flush whatever batch is
    /// in-flight before returning. Each iteration reads one batch,
    /// transforms it, and delivers it with retry; a batch that
    /// exhausts retries is dropped (counted, logged) rather than
    /// blocking the stream forever on a poison-pill backend outage.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        self.plugin.init().await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "dispatcher plugin failed to initialize");
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                batch = self.bus.recv_batch(self.config.batch_size, self.config.flush_interval) => {
                    match batch {
                        Ok(batch) if batch.events.is_empty() => continue,
                        Ok(batch) => self.deliver_batch(batch.events, batch.ack).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "bus unavailable, backing off before retrying");
                            tokio::time::sleep(self.config.retry_backoff).await;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.plugin.close().await {
            tracing::warn!(error = %e, "dispatcher plugin failed to close cleanly");
        }
    }

    async fn deliver_batch(&self, events: Vec<crate::model::Event>, ack: AckToken) {
        self.metrics.processed.fetch_add(events.len() as u64, Ordering::Relaxed);

        let payloads: Vec<_> = events.iter().map(|event| transform::transform(event, self.plugin_kind)).collect();

        let mut delay = self.config.retry_backoff;
        let mut attempt = 0;

        loop {
            match self.plugin.send(&payloads).await {
                Ok(()) => {
                    self.metrics.sent.fetch_add(payloads.len() as u64, Ordering::Relaxed);
                    if let Err(e) = self.bus.ack(ack).await {
                        tracing::warn!(error = %e, "failed to acknowledge delivered batch");
                    }
                    return;
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(error = %e, batch_size = payloads.len(), "permanent delivery failure, dropping batch");
                    self.metrics.dropped.fetch_add(payloads.len() as u64, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.retry_attempts {
                        tracing::error!(error = %e, batch_size = payloads.len(), attempt, "exhausted retries, dropping batch");
                        self.metrics.dropped.fetch_add(payloads.len() as u64, Ordering::Relaxed);
                        return;
                    }
                    tracing::warn!(error = %e, attempt, "transient delivery failure, retrying after backoff");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBus;
    use crate::config::DispatcherConfig;
    use crate::model::Event;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingPlugin {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl BackendPlugin for CountingPlugin {
        async fn send(&self, _batch: &[crate::model::EventPayload]) -> Result<(), plugin::PluginError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(plugin::PluginError::Transient("simulated".to_string()));
            }
            Ok(())
        }
    }

    fn sample_event() -> Event {
        Event {
            request_id: uuid::Uuid::now_v7(),
            project_id: None,
            token_id: None,
            method: "GET".to_string(),
            path: "/v1/models".to_string(),
            status: 200,
            cache_hit: false,
            duration_ms: 1,
            request_body: None,
            response_body: None,
            truncated: false,
            response_headers: Vec::new(),
            occurred_at: chrono::Utc::now(),
            log_id: None,
        }
    }

    #[tokio::test]
    async fn a_transient_failure_is_retried_until_it_succeeds() {
        let bus = Arc::new(Bus::InMemory(Arc::new(InMemoryBus::new())));
        let plugin = Arc::new(CountingPlugin {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let config = DispatcherConfig {
            batch_size: 10,
            flush_interval: std::time::Duration::from_millis(50),
            retry_attempts: 3,
            retry_backoff: std::time::Duration::from_millis(1),
            ..DispatcherConfig::default()
        };

        let dispatcher = DispatcherService {
            bus,
            plugin,
            plugin_kind: PluginKind::File,
            config,
            metrics: Arc::new(DispatcherMetrics::default()),
        };

        dispatcher.deliver_batch(vec![sample_event()], AckToken::default()).await;
        assert_eq!(dispatcher.metrics.sent.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.metrics.dropped.load(Ordering::SeqCst), 0);
    }
}
