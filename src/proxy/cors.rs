//! CORS policy built from the static allow-list in [`crate::config::ProxyConfig`].
//!
//! Grounded on the teacher's `tower_http::cors::CorsLayer` usage in
//! `api::middleware`: an explicit origin allow-list, never `Any` with
//! credentials, so only configured origins are ever echoed back.

use http::{HeaderName, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::ProxyConfig;

/// Build a [`CorsLayer`] from the proxy's static configuration.
pub fn build(config: &ProxyConfig) -> CorsLayer {
    let origins: Vec<_> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let methods: Vec<Method> = config
        .cors_allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();

    let headers: Vec<HeaderName> = config
        .cors_allowed_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(headers)
}
