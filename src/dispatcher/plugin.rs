//! Backend plugins (spec section 5.4, component C9): the pluggable
//! delivery targets a batch of transformed events is sent to.
//!
//! A fixed, closed set of backends is selected at startup via
//! [`crate::config::PluginKind`] and built once — matching this crate's
//! compile-time-dispatch preference (spec section 9) over a runtime
//! plugin registry. Grounded on the teacher's `api::webhooks` delivery
//! loop (POST, response-status classification) and its
//! `enterprise::eventsource` file-sink style for the
//! newline-delimited-JSON backend.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::PluginKind;
use crate::model::EventPayload;

/// Why a delivery attempt failed.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Retrying is pointless: bad credentials, malformed payload,
    /// backend rejected the batch outright (4xx other than 429).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// Retrying may succeed: network error, timeout, 5xx, 429.
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl PluginError {
    /// Whether [`crate::dispatcher::DispatcherService`] should retry
    /// this batch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginError::Transient(_))
    }
}

/// A delivery target for a batch of [`EventPayload`]s.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    /// One-time setup (open a file handle, validate plugin settings).
    async fn init(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Deliver one batch. Implementations must classify failures as
    /// [`PluginError::Permanent`] or [`PluginError::Transient`] so the
    /// dispatcher knows whether to retry.
    async fn send(&self, batch: &[EventPayload]) -> Result<(), PluginError>;

    /// Flush and release any held resources at shutdown.
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Build the configured plugin from `service` plus its settings map.
pub fn build(kind: PluginKind, settings: &HashMap<String, String>) -> Result<Arc<dyn BackendPlugin>, PluginError> {
    match kind {
        PluginKind::File => Ok(Arc::new(FilePlugin::from_settings(settings)?)),
        PluginKind::SinkA => Ok(Arc::new(SinkAPlugin::from_settings(settings)?)),
        PluginKind::SinkB => Ok(Arc::new(SinkBPlugin::from_settings(settings)?)),
    }
}

/// Newline-delimited-JSON append-only file sink, `fsync`'d after every
/// batch so a crash between batches never loses an acknowledged write.
pub struct FilePlugin {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl FilePlugin {
    fn from_settings(settings: &HashMap<String, String>) -> Result<Self, PluginError> {
        let path = settings
            .get("path")
            .ok_or_else(|| PluginError::Permanent("file plugin requires a \"path\" setting".to_string()))?;
        Ok(Self {
            path: PathBuf::from(path),
            file: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BackendPlugin for FilePlugin {
    async fn init(&self) -> Result<(), PluginError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PluginError::Permanent(format!("opening {}: {e}", self.path.display())))?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn send(&self, batch: &[EventPayload]) -> Result<(), PluginError> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| PluginError::Permanent("file plugin used before init".to_string()))?;

        for payload in batch {
            let line = serde_json::to_string(payload)
                .map_err(|e| PluginError::Permanent(format!("serializing event: {e}")))?;
            writeln!(file, "{line}").map_err(|e| PluginError::Transient(format!("writing to {}: {e}", self.path.display())))?;
        }
        file.sync_data()
            .map_err(|e| PluginError::Transient(format!("fsync {}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// Per-event bearer-authenticated POST sink, delivering each event in
/// the batch individually (the backend has no batch endpoint).
/// Grounded on the teacher's `attempt_delivery` in `api::webhooks`.
pub struct SinkAPlugin {
    endpoint: String,
    bearer_token: String,
    client: reqwest::Client,
}

impl SinkAPlugin {
    fn from_settings(settings: &HashMap<String, String>) -> Result<Self, PluginError> {
        let endpoint = settings
            .get("endpoint")
            .ok_or_else(|| PluginError::Permanent("sink-a plugin requires an \"endpoint\" setting".to_string()))?
            .clone();
        let bearer_token = settings
            .get("bearer_token")
            .ok_or_else(|| PluginError::Permanent("sink-a plugin requires a \"bearer_token\" setting".to_string()))?
            .clone();
        Ok(Self {
            endpoint,
            bearer_token,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl BackendPlugin for SinkAPlugin {
    async fn send(&self, batch: &[EventPayload]) -> Result<(), PluginError> {
        for payload in batch {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.bearer_token)
                .json(payload)
                .send()
                .await
                .map_err(|e| PluginError::Transient(e.to_string()))?;

            classify_response_status(response.status())?;
        }
        Ok(())
    }
}

/// Provider-proxied-shape sink: wraps each event's `response_text` (if
/// any) as the body of an upstream-shaped envelope, base64-encoding it
/// when it isn't valid UTF-8 JSON so the backend's schema still parses.
pub struct SinkBPlugin {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl SinkBPlugin {
    fn from_settings(settings: &HashMap<String, String>) -> Result<Self, PluginError> {
        let endpoint = settings
            .get("endpoint")
            .ok_or_else(|| PluginError::Permanent("sink-b plugin requires an \"endpoint\" setting".to_string()))?
            .clone();
        let api_key = settings
            .get("api_key")
            .ok_or_else(|| PluginError::Permanent("sink-b plugin requires an \"api_key\" setting".to_string()))?
            .clone();
        Ok(Self {
            endpoint,
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl BackendPlugin for SinkBPlugin {
    async fn send(&self, batch: &[EventPayload]) -> Result<(), PluginError> {
        let envelope: Vec<serde_json::Value> = batch
            .iter()
            .map(|payload| {
                let body_is_json = payload
                    .response_text
                    .as_deref()
                    .map(|text| serde_json::from_str::<serde_json::Value>(text).is_ok())
                    .unwrap_or(true);

                let response_text = if body_is_json {
                    payload.response_text.clone()
                } else {
                    payload.response_text.as_deref().map(|text| BASE64_STANDARD.encode(text))
                };

                serde_json::json!({
                    "request_id": payload.request_id,
                    "project_id": payload.project_id,
                    "model": payload.model,
                    "usage": {
                        "prompt_tokens": payload.prompt_tokens,
                        "completion_tokens": payload.completion_tokens,
                        "total_tokens": payload.total_tokens,
                    },
                    "response_text": response_text,
                    "response_text_encoding": if body_is_json { "identity" } else { "base64" },
                    "occurred_at": payload.occurred_at,
                })
            })
            .collect();

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({ "events": envelope }))
            .send()
            .await
            .map_err(|e| PluginError::Transient(e.to_string()))?;

        classify_response_status(response.status())
    }
}

/// 2xx/3xx is success; 429 and 5xx are transient; any other 4xx is
/// permanent (the request itself is malformed and retrying won't help).
fn classify_response_status(status: reqwest::StatusCode) -> Result<(), PluginError> {
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(PluginError::Transient(format!("backend returned {status}")));
    }
    Err(PluginError::Permanent(format!("backend returned {status}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_redirect_statuses_are_not_errors() {
        assert!(classify_response_status(reqwest::StatusCode::OK).is_ok());
        assert!(classify_response_status(reqwest::StatusCode::FOUND).is_ok());
    }

    #[test]
    fn rate_limited_and_server_errors_are_transient() {
        assert!(classify_response_status(reqwest::StatusCode::TOO_MANY_REQUESTS)
            .unwrap_err()
            .is_retryable());
        assert!(classify_response_status(reqwest::StatusCode::BAD_GATEWAY)
            .unwrap_err()
            .is_retryable());
    }

    #[test]
    fn other_client_errors_are_permanent() {
        assert!(!classify_response_status(reqwest::StatusCode::BAD_REQUEST)
            .unwrap_err()
            .is_retryable());
        assert!(!classify_response_status(reqwest::StatusCode::UNAUTHORIZED)
            .unwrap_err()
            .is_retryable());
    }

    #[test]
    fn file_plugin_requires_a_path_setting() {
        let settings = HashMap::new();
        assert!(FilePlugin::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn file_plugin_appends_ndjson_lines() {
        let dir = std::env::temp_dir().join(format!("llm-proxy-test-{}", uuid::Uuid::new_v4()));
        let path = dir.with_extension("ndjson");

        let mut settings = HashMap::new();
        settings.insert("path".to_string(), path.display().to_string());
        let plugin = FilePlugin::from_settings(&settings).unwrap();
        plugin.init().await.unwrap();

        let payload = EventPayload {
            request_id: uuid::Uuid::now_v7(),
            project_id: None,
            token_id: None,
            method: "GET".to_string(),
            path: "/v1/models".to_string(),
            status: 200,
            cache_hit: false,
            duration_ms: 1,
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            response_text: None,
            occurred_at: chrono::Utc::now(),
            log_id: None,
        };
        plugin.send(&[payload]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        std::fs::remove_file(&path).ok();
    }
}
