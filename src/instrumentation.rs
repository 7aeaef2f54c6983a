//! Request/response instrumentation (spec section 4.5): a response tee
//! that forwards bytes to the client untouched while appending a
//! size-capped copy for observability, and the non-blocking event
//! publish that follows request completion.
//!
//! Grounded on the teacher's `request_id_middleware` in
//! `api::middleware` (read-or-generate request id, stamp it on both the
//! request extensions and the response) generalized from a single
//! header stamp into a full capture-and-publish wrapper.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::model::Event;

/// `X-Request-ID` header name, read from the inbound request if present
/// and always echoed on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Accumulates the pieces of an [`Event`] over the lifetime of one
/// request, then publishes it without awaiting anything past the call
/// to [`EventBus::publish`].
pub struct RequestRecorder {
    request_id: Uuid,
    method: String,
    path: String,
    started_at: Instant,
    capture_cap: usize,
    request_body: Option<Vec<u8>>,
}

impl RequestRecorder {
    /// Start recording a request. `capture_cap` bounds how many bytes of
    /// request/response body are retained for the emitted event.
    pub fn start(request_id: Uuid, method: String, path: String, capture_cap: usize) -> Self {
        Self {
            request_id,
            method,
            path,
            started_at: Instant::now(),
            capture_cap,
            request_body: None,
        }
    }

    /// Record the (possibly truncated) inbound body. The caller is
    /// responsible for restoring the original bytes to the handler —
    /// this only keeps a capped copy for the event.
    pub fn capture_request_body(&mut self, body: &[u8]) {
        self.request_body = Some(cap(body, self.capture_cap));
    }

    /// Finish recording and build the [`Event`] for this exchange.
    #[allow(clippy::too_many_arguments)]
    pub fn finish(
        self,
        project_id: Option<Uuid>,
        token_id: Option<Uuid>,
        status: u16,
        cache_hit: bool,
        response_body: Option<&[u8]>,
        response_truncated: bool,
        response_headers: Vec<(String, String)>,
    ) -> Event {
        Event {
            request_id: self.request_id,
            project_id,
            token_id,
            method: self.method,
            path: self.path,
            status,
            cache_hit,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            request_body: self.request_body,
            response_body: response_body.map(|body| cap(body, self.capture_cap)),
            truncated: response_truncated,
            response_headers,
            occurred_at: Utc::now(),
            log_id: None,
        }
    }
}

fn cap(bytes: &[u8], limit: usize) -> Vec<u8> {
    if bytes.len() > limit {
        bytes[..limit].to_vec()
    } else {
        bytes.to_vec()
    }
}

/// Publish `event` on `bus` without blocking the caller past the
/// `publish` call itself — the bus implementation owns whatever
/// durability work follows (spec: "event emission is fire-and-forget").
pub async fn emit(bus: &Arc<crate::bus::Bus>, event: Event) {
    bus.publish(event).await;
}

/// A byte sink that tees writes into a size-capped buffer while
/// counting total bytes seen, used to capture a streamed upstream
/// response body without buffering the whole thing in memory.
///
/// Grounded on the spec's requirement (4.4/9) that the tee "must not
/// buffer the entire response" — this struct only ever holds up to
/// `cap` bytes regardless of how large the streamed body is.
pub struct CappedTee {
    buffer: Vec<u8>,
    cap: usize,
    truncated: bool,
    total_len: usize,
}

impl CappedTee {
    /// A tee retaining at most `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap,
            truncated: false,
            total_len: 0,
        }
    }

    /// Observe the next chunk of a streamed body, in order.
    pub fn observe(&mut self, chunk: &[u8]) {
        self.total_len += chunk.len();
        if self.buffer.len() >= self.cap {
            if !chunk.is_empty() {
                self.truncated = true;
            }
            return;
        }
        let remaining = self.cap - self.buffer.len();
        if chunk.len() > remaining {
            self.buffer.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// The captured (possibly truncated) bytes.
    pub fn captured(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether the full body exceeded the cap.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Total bytes observed, including bytes dropped past the cap.
    pub fn total_len(&self) -> usize {
        self.total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_tee_retains_everything_under_the_cap() {
        let mut tee = CappedTee::new(16);
        tee.observe(b"hello");
        tee.observe(b" world");
        assert_eq!(tee.captured(), b"hello world");
        assert!(!tee.truncated());
        assert_eq!(tee.total_len(), 11);
    }

    #[test]
    fn capped_tee_truncates_past_the_cap_but_keeps_counting() {
        let mut tee = CappedTee::new(4);
        tee.observe(b"hello");
        tee.observe(b" world");
        assert_eq!(tee.captured(), b"hell");
        assert!(tee.truncated());
        assert_eq!(tee.total_len(), 11);
    }

    #[test]
    fn recorder_caps_request_body_capture() {
        let mut recorder = RequestRecorder::start(Uuid::now_v7(), "POST".to_string(), "/v1/x".to_string(), 4);
        recorder.capture_request_body(b"0123456789");
        let event = recorder.finish(None, None, 200, false, Some(b"abcdefgh"), false, Vec::new());
        assert_eq!(event.request_body, Some(b"0123".to_vec()));
        assert_eq!(event.response_body, Some(b"abcd".to_vec()));
    }
}
