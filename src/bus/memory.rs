//! `InMemoryBus`: a `tokio::sync::broadcast` channel. Lagging consumers
//! lose events rather than back-pressuring publishers — matching the
//! spec's requirement that `publish` never blocks the request path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::model::Event;

use super::{AckToken, BusError, EventBatch, EventBus};

/// Default channel capacity (spec: `B` = 1000).
pub const DEFAULT_CAPACITY: usize = 1000;

/// An in-process, non-durable event bus.
pub struct InMemoryBus {
    sender: broadcast::Sender<Event>,
    dropped: AtomicU64,
    consumer: Mutex<Option<broadcast::Receiver<Event>>>,
}

impl InMemoryBus {
    /// Build a bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Build a bus with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: AtomicU64::new(0),
            consumer: Mutex::new(None),
        }
    }

    /// Receive up to `max_batch` events, waiting up to `block_timeout`
    /// for the first one; returns immediately once the batch fills.
    pub async fn recv_batch(&self, max_batch: usize, block_timeout: Duration) -> Result<EventBatch, BusError> {
        let mut guard = self.consumer.lock().await;
        let receiver = guard.get_or_insert_with(|| self.sender.subscribe());

        let mut events = Vec::with_capacity(max_batch.min(64));
        let deadline = Instant::now() + block_timeout;

        while events.len() < max_batch {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Ok(event)) => events.push(event),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                }
                Ok(Err(RecvError::Closed)) => break,
                Err(_elapsed) => break,
            }
        }

        Ok(EventBatch {
            events,
            ack: AckToken::default(),
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: Event) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event() -> Event {
        Event {
            request_id: Uuid::now_v7(),
            project_id: None,
            token_id: None,
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            status: 200,
            cache_hit: false,
            duration_ms: 12,
            request_body: None,
            response_body: None,
            truncated: false,
            response_headers: Vec::new(),
            occurred_at: Utc::now(),
            log_id: None,
        }
    }

    #[tokio::test]
    async fn recv_batch_returns_published_events() {
        let bus = InMemoryBus::new();
        bus.publish(sample_event()).await;

        let batch = bus.recv_batch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test]
    async fn recv_batch_times_out_with_an_empty_batch_when_idle() {
        let bus = InMemoryBus::new();
        // Ensure a consumer is registered before measuring "no events".
        let _ = bus.recv_batch(1, Duration::from_millis(10)).await.unwrap();
        let batch = bus.recv_batch(10, Duration::from_millis(10)).await.unwrap();
        assert!(batch.events.is_empty());
    }

    #[tokio::test]
    async fn publishing_with_no_subscriber_yet_counts_as_dropped() {
        let bus = InMemoryBus::new();
        bus.publish(sample_event()).await;
        assert_eq!(bus.dropped_count(), 1);
    }
}
