//! Event-to-payload transformation (spec section 5.3, component C10): a
//! pure function from a captured [`Event`] to the [`EventPayload`] shape
//! a specific backend plugin expects, decoding the captured response
//! body (base64 is never applied at this layer — the body already
//! arrives as raw bytes — but the upstream content may itself be
//! gzip/brotli compressed, which this module reverses best-effort) and
//! falling back to a token-count estimate when the upstream response
//! carried no usage block.
//!
//! Grounded on the teacher's `enterprise::eventsource` payload shaping
//! and on `other_examples`' decode-then-best-effort-tokenize pattern
//! for provider responses whose usage field is absent (e.g. streamed
//! completions, which only emit usage on the final chunk).

use crate::config::PluginKind;
use crate::decode::decode_response_text;
use crate::model::{Event, EventPayload};

/// Build the backend-specific payload for `event`. Never panics and
/// never fabricates a field it could not extract — every optional
/// field in [`EventPayload`] stays `None` rather than guessing.
pub fn transform(event: &Event, kind: PluginKind) -> EventPayload {
    let response_text = event.response_body.as_deref().map(decode_response_text);

    let (model, prompt_tokens, completion_tokens, total_tokens) = response_text
        .as_deref()
        .map(extract_usage_from_text)
        .unwrap_or_default();

    let total_tokens = total_tokens.or_else(|| match (prompt_tokens, completion_tokens) {
        (Some(p), Some(c)) => Some(p + c),
        _ => None,
    });

    // SinkB expects a provider-proxied shape (section 5.3): when usage
    // is missing, it falls back to a best-effort tokenizer estimate
    // rather than omitting the field entirely.
    let completion_tokens = if matches!(kind, PluginKind::SinkB) && completion_tokens.is_none() {
        response_text.as_deref().and_then(estimate_tokens)
    } else {
        completion_tokens
    };

    EventPayload {
        request_id: event.request_id,
        project_id: event.project_id,
        token_id: event.token_id,
        method: event.method.clone(),
        path: event.path.clone(),
        status: event.status,
        cache_hit: event.cache_hit,
        duration_ms: event.duration_ms,
        model,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        response_text,
        occurred_at: event.occurred_at,
        log_id: event.log_id.clone(),
    }
}

type UsageFields = (Option<String>, Option<u64>, Option<u64>, Option<u64>);

/// Pull `model` and an OpenAI-shaped `usage` block out of a JSON
/// response body, tolerating any shape that isn't valid JSON or lacks
/// these fields.
fn extract_usage_from_text(text: &str) -> UsageFields {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Default::default();
    };

    let model = value.get("model").and_then(|v| v.as_str()).map(str::to_string);
    let usage = value.get("usage");
    let prompt_tokens = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64());
    let completion_tokens = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64());
    let total_tokens = usage.and_then(|u| u.get("total_tokens")).and_then(|v| v.as_u64());

    (model, prompt_tokens, completion_tokens, total_tokens)
}

/// Best-effort completion token estimate via `tiktoken-rs`'s `cl100k_base`
/// encoding, used only when the upstream response carried no usage
/// block at all. Never treated as authoritative; callers that need
/// exact accounting must rely on the upstream-reported `usage` field.
fn estimate_tokens(text: &str) -> Option<u64> {
    let bpe = tiktoken_rs::cl100k_base().ok()?;
    Some(bpe.encode_with_special_tokens(text).len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event(body: Option<Vec<u8>>) -> Event {
        Event {
            request_id: Uuid::now_v7(),
            project_id: Some(Uuid::now_v7()),
            token_id: Some(Uuid::now_v7()),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            status: 200,
            cache_hit: false,
            duration_ms: 42,
            request_body: None,
            response_body: body,
            truncated: false,
            response_headers: Vec::new(),
            occurred_at: Utc::now(),
            log_id: None,
        }
    }

    #[test]
    fn extracts_model_and_usage_from_a_plain_json_body() {
        let body = br#"{"model":"gpt-4","usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#.to_vec();
        let payload = transform(&sample_event(Some(body)), PluginKind::File);
        assert_eq!(payload.model.as_deref(), Some("gpt-4"));
        assert_eq!(payload.prompt_tokens, Some(10));
        assert_eq!(payload.total_tokens, Some(15));
    }

    #[test]
    fn derives_total_tokens_when_upstream_omits_it() {
        let body = br#"{"model":"gpt-4","usage":{"prompt_tokens":10,"completion_tokens":5}}"#.to_vec();
        let payload = transform(&sample_event(Some(body)), PluginKind::File);
        assert_eq!(payload.total_tokens, Some(15));
    }

    #[test]
    fn non_json_bodies_never_panic_and_yield_no_usage() {
        let payload = transform(&sample_event(Some(b"not json at all".to_vec())), PluginKind::File);
        assert!(payload.model.is_none());
        assert!(payload.prompt_tokens.is_none());
        assert_eq!(payload.response_text.as_deref(), Some("not json at all"));
    }

    #[test]
    fn a_missing_response_body_yields_no_response_text() {
        let payload = transform(&sample_event(None), PluginKind::File);
        assert!(payload.response_text.is_none());
    }

    #[test]
    fn sink_b_estimates_completion_tokens_when_usage_is_absent() {
        let body = br#"{"model":"gpt-4","choices":[{"text":"hello there friend"}]}"#.to_vec();
        let payload = transform(&sample_event(Some(body)), PluginKind::SinkB);
        assert!(payload.completion_tokens.is_some());
    }
}
