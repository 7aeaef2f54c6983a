//! Event bus (spec section 4.6): publishes [`Event`]s for the
//! dispatcher to consume, never blocking the request path on the
//! publish call.

pub mod memory;
pub mod streams;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::model::Event;

use memory::InMemoryBus;
use streams::RedisStreamsBus;

/// Errors reading from or acknowledging a bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The durable backend (Redis) could not be reached.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// A handle to a queue of events. `publish` never returns an error the
/// caller must handle — a failure to enqueue is an internal condition
/// (buffer full, connection down) the bus accounts for itself.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Enqueue an event. Must not await any I/O tied to the event
    /// actually landing durably; implementations spawn that work.
    async fn publish(&self, event: Event);

    /// Current count of events dropped since startup (lagging
    /// subscriber, buffer overflow, or publish-time failure).
    fn dropped_count(&self) -> u64;

    /// Signal shutdown. Implementations should stop accepting new
    /// subscriptions; in-flight publishes are allowed to complete.
    async fn stop(&self);
}

/// Opaque handle to whatever must be acknowledged once a batch has been
/// durably handled by the dispatcher. An in-memory batch needs no
/// acknowledgement; a streams batch carries the message ids to `XACK`.
#[derive(Debug, Default, Clone)]
pub struct AckToken {
    pub(crate) stream_ids: Vec<String>,
}

/// A batch of events read from a bus, with enough context to acknowledge it.
pub struct EventBatch {
    /// The events themselves, in receive order.
    pub events: Vec<Event>,
    /// Pass back to [`Bus::ack`] once the batch has been durably handled.
    pub ack: AckToken,
}

/// The bus implementation selected at startup. A sum type rather than a
/// runtime registry, matching this crate's preference for compile-time
/// dispatch wherever the set of variants is fixed and small.
pub enum Bus {
    /// Non-durable, single-process.
    InMemory(Arc<InMemoryBus>),
    /// Durable, consumer-group-based, backed by Redis Streams.
    Streams(Arc<RedisStreamsBus>),
}

#[async_trait]
impl EventBus for Bus {
    async fn publish(&self, event: Event) {
        match self {
            Bus::InMemory(bus) => bus.publish(event).await,
            Bus::Streams(bus) => bus.publish(event).await,
        }
    }

    fn dropped_count(&self) -> u64 {
        match self {
            Bus::InMemory(bus) => bus.dropped_count(),
            Bus::Streams(bus) => bus.dropped_count(),
        }
    }

    async fn stop(&self) {
        match self {
            Bus::InMemory(bus) => bus.stop().await,
            Bus::Streams(bus) => bus.stop().await,
        }
    }
}

impl Bus {
    /// Receive up to `max_batch` events, waiting up to `block_timeout`
    /// for at least one to arrive. An idle bus returns an empty batch,
    /// never an error.
    pub async fn recv_batch(&self, max_batch: usize, block_timeout: Duration) -> Result<EventBatch, BusError> {
        match self {
            Bus::InMemory(bus) => bus.recv_batch(max_batch, block_timeout).await,
            Bus::Streams(bus) => bus.recv_batch(max_batch, block_timeout).await,
        }
    }

    /// Acknowledge a previously received batch as durably handled.
    pub async fn ack(&self, token: AckToken) -> Result<(), BusError> {
        match self {
            Bus::InMemory(_) => Ok(()),
            Bus::Streams(bus) => bus.ack(token).await,
        }
    }
}
