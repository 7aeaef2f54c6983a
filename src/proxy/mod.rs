//! The reverse proxy handler (spec section 4.4, component C7): the
//! state machine that authenticates a request, substitutes the
//! project's upstream credential, forwards it (streaming both ways),
//! and arranges for the exchange to be cached and observed.

pub mod cors;
pub mod handler;
pub mod metadata;
pub mod pool;
pub mod whitelist;

use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::Bus;
use crate::config::ProxyConfig;
use crate::ratelimit::RateLimiter;
use crate::respcache::ResponseCache;
use crate::store::ProjectStore;
use crate::validator::TokenValidator;
use whitelist::ParamWhitelist;

/// Shared, process-lifetime state handed to every inbound request.
///
/// Every field here is one of the "global mutable state" singletons
/// spec section 9 calls out by name: validator cache, response cache,
/// rate limiter, and connection pool. They are threaded through as an
/// explicit collaborator (`Arc<AppState>` in axum's `State` extractor),
/// never reached for through a `static`/`OnceCell` ambient global.
pub struct AppState {
    /// Loaded, validated configuration.
    pub config: Arc<ProxyConfig>,
    /// Token validator (cache-fronted store lookups).
    pub validator: Arc<dyn TokenValidator>,
    /// Project lookups, consulted once per cache-miss request.
    pub project_store: Arc<dyn ProjectStore>,
    /// Per-token request-rate enforcement.
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Fingerprinted response cache.
    pub response_cache: Arc<ResponseCache>,
    /// Event bus events are published to after each exchange.
    pub bus: Arc<Bus>,
    /// Shared upstream HTTP client (connection pool).
    pub http_client: reqwest::Client,
    /// Compiled per-endpoint param whitelist.
    pub param_whitelist: Arc<ParamWhitelist>,
}

impl AppState {
    /// Resolve the provider a path should be forwarded to. With a
    /// single configured provider this is unambiguous; with several,
    /// the first configured provider is used (the spec does not define
    /// path-based multi-provider routing beyond per-path endpoint
    /// allow-listing, which is enforced separately).
    pub fn default_provider(&self) -> Option<(&String, &crate::config::ProviderConfig)> {
        self.config.providers.iter().next()
    }

    /// Whether `path` matches one of the configured allowed-endpoint
    /// prefixes.
    pub fn path_allowed(&self, path: &str) -> bool {
        self.config
            .allowed_endpoints
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether `method` is in the configured allow-list.
    pub fn method_allowed(&self, method: &http::Method) -> bool {
        self.config
            .allowed_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
    }

    /// Whether every configured required header is present.
    pub fn required_headers_present(&self, headers: &http::HeaderMap) -> Option<String> {
        self.config
            .required_headers
            .iter()
            .find(|name| !headers.contains_key(name.as_str()))
            .cloned()
    }
}

/// Sorted, owned query pairs from a raw query string, used both for the
/// cache fingerprint and (incidentally) for readable logging.
pub fn sorted_query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    pairs.sort();
    pairs
}

/// Hop-by-hop headers stripped before forwarding, per RFC 7230 section
/// 6.1 plus the client's own `Authorization` (always replaced) and
/// `Host` (always reset to the upstream origin).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "authorization",
];

/// Whether `name` should never be forwarded upstream.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Build the map of configured-provider header prefixes, used when
/// naming `X-<Provider>-*` metadata response headers.
pub fn provider_header_prefixes(config: &ProxyConfig) -> HashMap<String, String> {
    config
        .providers
        .iter()
        .map(|(name, provider)| (name.clone(), provider.header_prefix.clone()))
        .collect()
}
