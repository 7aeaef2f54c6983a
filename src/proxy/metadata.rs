//! Best-effort upstream response metadata extraction (spec section 4.4):
//! pulls `usage.{prompt,completion,total}_tokens`, `model`, `id`, and
//! `created` out of a JSON response body and turns them into
//! `X-<Provider>-*` response headers. Tolerant of any field being
//! missing — this never fails a request. The captured body is reversed
//! through the same best-effort gzip/brotli decode the dispatcher's
//! event transformer uses, since upstream responses may be compressed.

use serde_json::Value;

use crate::decode::decode_response_text;

/// Extracted top-level metadata fields, each independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// Upstream-reported model identifier, e.g. `"gpt-4"`.
    pub model: Option<String>,
    /// Upstream-reported response id.
    pub id: Option<String>,
    /// Upstream-reported unix creation timestamp.
    pub created: Option<i64>,
    /// `usage.prompt_tokens`.
    pub prompt_tokens: Option<u64>,
    /// `usage.completion_tokens`.
    pub completion_tokens: Option<u64>,
    /// `usage.total_tokens`.
    pub total_tokens: Option<u64>,
}

impl ResponseMetadata {
    /// Whether any field was actually extracted.
    pub fn is_empty(&self) -> bool {
        self == &ResponseMetadata::default()
    }

    /// Turn the extracted fields into `X-<prefix>-*` response headers.
    /// `prefix` is the provider's configured header prefix (e.g. `"OpenAI"`).
    pub fn into_headers(self, prefix: &str) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(model) = self.model {
            headers.push((format!("x-{prefix}-model"), model));
        }
        if let Some(id) = self.id {
            headers.push((format!("x-{prefix}-id"), id));
        }
        if let Some(created) = self.created {
            headers.push((format!("x-{prefix}-created"), created.to_string()));
        }
        if let Some(prompt_tokens) = self.prompt_tokens {
            headers.push((format!("x-{prefix}-prompt-tokens"), prompt_tokens.to_string()));
        }
        if let Some(completion_tokens) = self.completion_tokens {
            headers.push((format!("x-{prefix}-completion-tokens"), completion_tokens.to_string()));
        }
        if let Some(total_tokens) = self.total_tokens {
            headers.push((format!("x-{prefix}-total-tokens"), total_tokens.to_string()));
        }
        headers
    }
}

/// Parse metadata out of a JSON response body. Returns an empty
/// [`ResponseMetadata`] (never an error) when the body isn't valid JSON
/// or isn't shaped as expected — metadata extraction is best-effort and
/// must never fail a request.
pub fn extract(body: &[u8]) -> ResponseMetadata {
    let text = decode_response_text(body);
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return ResponseMetadata::default();
    };
    extract_from_value(&value)
}

fn extract_from_value(value: &Value) -> ResponseMetadata {
    let usage = value.get("usage");
    ResponseMetadata {
        model: value.get("model").and_then(Value::as_str).map(str::to_string),
        id: value.get("id").and_then(Value::as_str).map(str::to_string),
        created: value.get("created").and_then(Value::as_i64),
        prompt_tokens: usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64),
        completion_tokens: usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64),
        total_tokens: usage.and_then(|u| u.get("total_tokens")).and_then(Value::as_u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_all_fields_when_present() {
        let body = json!({
            "model": "gpt-4",
            "id": "chatcmpl-123",
            "created": 1_700_000_000,
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        });
        let metadata = extract(body.to_string().as_bytes());
        assert_eq!(metadata.model.as_deref(), Some("gpt-4"));
        assert_eq!(metadata.prompt_tokens, Some(1));
        assert_eq!(metadata.total_tokens, Some(3));
    }

    #[test]
    fn missing_fields_are_tolerated() {
        let body = json!({"model": "gpt-4"});
        let metadata = extract(body.to_string().as_bytes());
        assert_eq!(metadata.model.as_deref(), Some("gpt-4"));
        assert_eq!(metadata.prompt_tokens, None);
    }

    #[test]
    fn non_json_bodies_yield_empty_metadata_not_an_error() {
        let metadata = extract(b"not json at all");
        assert!(metadata.is_empty());
    }

    #[test]
    fn headers_only_include_extracted_fields() {
        let metadata = ResponseMetadata {
            model: Some("gpt-4".to_string()),
            ..Default::default()
        };
        let headers = metadata.into_headers("OpenAI");
        assert_eq!(headers, vec![("x-OpenAI-model".to_string(), "gpt-4".to_string())]);
    }
}
