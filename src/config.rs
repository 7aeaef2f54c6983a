//! Layered configuration for the proxy and dispatcher binaries.
//!
//! A config file (TOML) is merged with `PROXY_`-prefixed environment
//! variable overrides. Missing file falls back to built-in defaults.
//! Validation failures are fatal at startup (spec section 7: "Fatal
//! init"); nothing here panics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed as TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// A value failed semantic validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level proxy configuration (spec section 6 configuration table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address for the proxy HTTP listener.
    pub listen_addr: String,
    /// One entry per configured upstream LLM provider.
    pub providers: HashMap<String, ProviderConfig>,
    /// Path prefixes accepted by the reverse proxy.
    pub allowed_endpoints: Vec<String>,
    /// HTTP methods accepted.
    pub allowed_methods: Vec<String>,
    /// CORS allow-list of origins.
    pub allowed_origins: Vec<String>,
    /// CORS allowed methods (echoed on `OPTIONS`).
    pub cors_allowed_methods: Vec<String>,
    /// CORS allowed headers (echoed on `OPTIONS`).
    pub cors_allowed_headers: Vec<String>,
    /// Headers that must be present on every inbound request.
    pub required_headers: Vec<String>,
    /// Per-endpoint, per-field value allow-lists (glob patterns matched
    /// against the field's actual value, e.g. `{"model": ["gpt-4*"]}`).
    pub param_whitelist: HashMap<String, HashMap<String, Vec<String>>>,
    /// Upstream connection pool sizing.
    pub pool: PoolConfig,
    /// Response cache policy.
    pub cache: CacheConfig,
    /// Reject requests whose project is inactive.
    pub enforce_project_active: bool,
    /// Default token rate-limit window.
    #[serde(with = "humantime_seconds")]
    pub rate_limit_window: Duration,
    /// Default token rate-limit max requests per window.
    pub rate_limit_max: u64,
    /// Event bus backend selection.
    pub event_bus: EventBusKind,
    /// Redis Streams tuning (only meaningful when `event_bus = streams`).
    pub streams: StreamsConfig,
    /// Size cap, in bytes, for captured request/response bodies.
    pub capture_max_bytes: usize,
    /// Request end-to-end timeout.
    #[serde(with = "humantime_seconds")]
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            providers: HashMap::new(),
            allowed_endpoints: vec!["/v1/".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            allowed_origins: Vec::new(),
            cors_allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            cors_allowed_headers: vec!["Authorization".to_string(), "Content-Type".to_string()],
            required_headers: Vec::new(),
            param_whitelist: HashMap::new(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            enforce_project_active: true,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 120,
            event_bus: EventBusKind::InMemory,
            streams: StreamsConfig::default(),
            capture_max_bytes: 64 * 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from an optional file, then apply `PROXY_*`
    /// environment variable overrides, then validate.
    pub fn from_env_and_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => ProxyConfig::default(),
        };

        if let Ok(addr) = std::env::var("PROXY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(val) = std::env::var("PROXY_RATE_LIMIT_MAX") {
            if let Ok(parsed) = val.parse() {
                config.rate_limit_max = parsed;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what serde's `Deserialize` can catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("listen_addr: {e}")))?;

        if self.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [providers.*] entry is required".to_string(),
            ));
        }
        for (name, provider) in &self.providers {
            if reqwest::Url::parse(&provider.target_base_url).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "providers.{name}.target_base_url is not a valid URL"
                )));
            }
        }

        if matches!(self.event_bus, EventBusKind::Streams) && self.streams.stream_key.is_empty() {
            return Err(ConfigError::Invalid(
                "streams.stream_key is required when event_bus = \"streams\"".to_string(),
            ));
        }

        for method in &self.allowed_methods {
            if method.parse::<http::Method>().is_err() {
                return Err(ConfigError::Invalid(format!("unknown HTTP method: {method}")));
            }
        }

        Ok(())
    }
}

/// One configured upstream LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Upstream origin, e.g. `https://api.openai.com`.
    pub target_base_url: String,
    /// Header name receiving `X-<Provider>-*` metadata (e.g. `"OpenAI"`).
    pub header_prefix: String,
}

/// Upstream connection pool sizing (spec section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections across all hosts.
    pub max_idle_conns: usize,
    /// Maximum idle connections per upstream host.
    pub max_idle_conns_per_host: usize,
    /// How long an idle connection may sit before being closed.
    #[serde(with = "humantime_seconds")]
    pub idle_conn_timeout: Duration,
    /// Timeout waiting for upstream response headers.
    #[serde(with = "humantime_seconds")]
    pub response_header_timeout: Duration,
    /// How often the streaming proxy flushes buffered bytes to the client.
    #[serde(with = "humantime_millis")]
    pub flush_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_conns_per_host: 20,
            idle_conn_timeout: Duration::from_secs(90),
            response_header_timeout: Duration::from_secs(30),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Response cache policy (spec section 4.3 / 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the response cache is consulted/populated at all.
    pub cache_enabled: bool,
    /// Default TTL when the upstream response has no `Cache-Control: max-age`.
    #[serde(with = "humantime_seconds")]
    pub cache_default_ttl: Duration,
    /// Maximum cache size, in bytes, across all entries.
    pub cache_max_bytes: u64,
    /// Maximum number of entries held regardless of byte budget.
    pub cache_max_entries: u64,
    /// Response headers contributing to the fingerprint's Vary component.
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_default_ttl: Duration::from_secs(300),
            cache_max_bytes: 256 * 1024 * 1024,
            cache_max_entries: 50_000,
            vary_headers: vec!["Accept".to_string(), "Accept-Encoding".to_string()],
        }
    }
}

/// Which `EventBus` implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBusKind {
    /// Bounded in-process broadcast channel; loses events under backpressure.
    InMemory,
    /// Redis Streams with consumer groups; durable, at-least-once.
    Streams,
}

/// Redis Streams bus tuning (spec section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Stream key events are appended to.
    pub stream_key: String,
    /// Consumer group name.
    pub consumer_group: String,
    /// This consumer's name within the group.
    pub consumer_name: String,
    /// Approximate max stream length (`XADD ... MAXLEN ~`).
    pub stream_max_len: u64,
    /// Blocking read timeout for `XREADGROUP`.
    #[serde(with = "humantime_millis")]
    pub stream_block_time: Duration,
    /// Idle time after which a pending message may be claimed by another consumer.
    #[serde(with = "humantime_millis")]
    pub stream_claim_time: Duration,
    /// Batch size for `XREADGROUP COUNT`.
    pub stream_batch_size: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_key: "llm-proxy:events".to_string(),
            consumer_group: "dispatcher".to_string(),
            consumer_name: "dispatcher-1".to_string(),
            stream_max_len: 1_000_000,
            stream_block_time: Duration::from_secs(5),
            stream_claim_time: Duration::from_secs(30),
            stream_batch_size: 100,
        }
    }
}

/// Dispatcher binary configuration (spec section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Which plugin backend to deliver batches to.
    pub service: PluginKind,
    /// Shares the same streams tuning as the proxy.
    pub streams: StreamsConfig,
    /// Number of events buffered before an eager flush.
    pub batch_size: usize,
    /// Maximum time an incomplete batch is held before flushing anyway.
    #[serde(with = "humantime_millis")]
    pub flush_interval: Duration,
    /// Retry attempts for a transient plugin failure before giving up.
    pub retry_attempts: u32,
    /// Base backoff between retries (doubled each attempt).
    #[serde(with = "humantime_millis")]
    pub retry_backoff: Duration,
    /// Plugin-specific key/value settings (API keys, endpoints, file paths).
    pub plugin_settings: HashMap<String, String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            service: PluginKind::File,
            streams: StreamsConfig::default(),
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            plugin_settings: HashMap::new(),
        }
    }
}

/// Selects which [`crate::dispatcher::plugin::BackendPlugin`] to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    /// Newline-delimited JSON file sink.
    File,
    /// Per-event bearer-authenticated POST sink.
    SinkA,
    /// Per-event provider-proxied-shape sink.
    SinkB,
}

mod humantime_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fail_validation_without_a_provider() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn a_configured_provider_passes_validation() {
        let mut config = ProxyConfig::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderConfig {
                target_base_url: "https://api.openai.com".to_string(),
                header_prefix: "OpenAI".to_string(),
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn streams_bus_requires_a_stream_key() {
        let mut config = ProxyConfig::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderConfig {
                target_base_url: "https://api.openai.com".to_string(),
                header_prefix: "OpenAI".to_string(),
            },
        );
        config.event_bus = EventBusKind::Streams;
        config.streams.stream_key.clear();
        assert!(config.validate().is_err());
    }
}
