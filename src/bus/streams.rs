//! `RedisStreamsBus`: a durable, at-least-once event bus over Redis
//! Streams with a consumer group, grounded on the teacher's
//! `redis::cmd("...").arg(...)` call style (seen throughout its
//! scheduling/queue module).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::StreamsConfig;
use crate::model::Event;

use super::{AckToken, BusError, EventBatch, EventBus};

/// A durable event bus backed by a Redis stream and consumer group.
pub struct RedisStreamsBus {
    redis: ConnectionManager,
    config: StreamsConfig,
    dropped: AtomicU64,
}

impl RedisStreamsBus {
    /// Build a bus over an already-connected Redis connection manager.
    /// Callers must have already created the consumer group (`XGROUP
    /// CREATE ... MKSTREAM`) — see [`Self::ensure_group`].
    pub fn new(redis: ConnectionManager, config: StreamsConfig) -> Self {
        Self {
            redis,
            config,
            dropped: AtomicU64::new(0),
        }
    }

    /// Idempotently create the stream and consumer group, tolerating
    /// `BUSYGROUP` (already exists).
    pub async fn ensure_group(&self) -> Result<(), BusError> {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(error) => Err(BusError::Unavailable(error.to_string())),
        }
    }

    /// Reclaim messages that have been pending longer than
    /// `stream_claim_time`, so a crashed consumer's in-flight batch is
    /// eventually retried by another.
    pub async fn claim_stale(&self) -> Result<Vec<(String, Event)>, BusError> {
        let mut conn = self.redis.clone();
        let min_idle_ms = self.config.stream_claim_time.as_millis() as u64;

        let raw: redis::streams::StreamClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.config.stream_batch_size)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        Ok(decode_stream_ids(raw.ids))
    }
}

fn decode_stream_ids(ids: Vec<redis::streams::StreamId>) -> Vec<(String, Event)> {
    let mut out = Vec::with_capacity(ids.len());
    for entry in ids {
        let payload: Option<String> = entry.get("payload");
        let Some(payload) = payload else { continue };
        match serde_json::from_str::<Event>(&payload) {
            Ok(mut event) => {
                event.log_id = Some(entry.id.clone());
                out.push((entry.id, event));
            }
            Err(error) => tracing::warn!(%error, message_id = %entry.id, "dropping unparseable stream entry"),
        }
    }
    out
}

#[async_trait]
impl EventBus for RedisStreamsBus {
    async fn publish(&self, event: Event) {
        let mut conn = self.redis.clone();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize event for publish");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let result: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.stream_max_len)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await;

        if let Err(error) = result {
            tracing::warn!(%error, "failed to publish event to redis stream");
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn stop(&self) {}
}

impl RedisStreamsBus {
    /// Read up to `max_batch` new messages for this bus's consumer,
    /// blocking up to `block_timeout` for the first one.
    pub async fn recv_batch(&self, max_batch: usize, block_timeout: Duration) -> Result<EventBatch, BusError> {
        let mut conn = self.redis.clone();
        let block_ms = block_timeout.as_millis().max(1) as u64;

        let reply: Option<redis::streams::StreamReadReply> = conn
            .xread_options(
                &[&self.config.stream_key],
                &[">"],
                &redis::streams::StreamReadOptions::default()
                    .group(&self.config.consumer_group, &self.config.consumer_name)
                    .count(max_batch)
                    .block(block_ms as usize),
            )
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let mut events = Vec::new();
        let mut stream_ids = Vec::new();

        if let Some(reply) = reply {
            for stream_key in reply.keys {
                for (message_id, event) in decode_stream_ids(stream_key.ids) {
                    stream_ids.push(message_id);
                    events.push(event);
                }
            }
        }

        Ok(EventBatch {
            events,
            ack: AckToken { stream_ids },
        })
    }

    /// `XACK` a previously received batch.
    pub async fn ack(&self, token: AckToken) -> Result<(), BusError> {
        if token.stream_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.config.stream_key).arg(&self.config.consumer_group);
        for id in &token.stream_ids {
            cmd.arg(id);
        }
        let _: u64 = cmd.query_async(&mut conn).await.map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
