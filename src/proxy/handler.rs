//! The `proxy_handler` axum handler implementing the state machine from
//! spec section 4.4:
//!
//! `ACCEPT → METHOD_PATH_ALLOWED? → REQUIRED_HEADERS_PRESENT? →
//! AUTH_PRESENT? → CACHE_CHECK → [CACHED→RESPOND | MISS→VALIDATE_TOKEN →
//! ENFORCE_PROJECT_ACTIVE? → LOAD_UPSTREAM_KEY → PARAM_WHITELIST_CHECK →
//! FORWARD → CAPTURE_METADATA → MAYBE_STORE_CACHE → EMIT_EVENT → RESPOND]`
//!
//! Grounded on the teacher's `api::gateway` connection/retry config
//! shapes and the `other_examples` Ai-Link `proxy-handler.rs` (bearer
//! extraction, upstream key substitution with `zeroize`, streaming
//! forward, usage/model extraction from the JSON response).

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::ProxyError;
use crate::instrumentation::{CappedTee, RequestRecorder, REQUEST_ID_HEADER};
use crate::model::CachedResponse;
use crate::respcache::{fingerprint, max_age_from_cache_control, CacheKeyParts};
use crate::validator::ValidationError;

use super::{is_hop_by_hop, sorted_query_pairs, AppState};

/// Entry point wired into the router for every allowed path prefix.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let path = uri.path().to_string();
    let request_id = inbound_or_new_request_id(&headers);

    if !state.method_allowed(&method) {
        return Err(ProxyError::MethodNotAllowed(format!("{method} is not an allowed method")));
    }
    if !state.path_allowed(&path) {
        return Err(ProxyError::NotFound(format!("no configured endpoint matches {path}")));
    }
    if let Some(missing) = state.required_headers_present(&headers) {
        return Err(ProxyError::BadRequest(format!("missing required header: {missing}")));
    }

    let token_secret = extract_bearer_token(&headers)
        .ok_or_else(|| ProxyError::Unauthorized("missing or malformed Authorization header".to_string()))?;

    let mut recorder = RequestRecorder::start(request_id, method.to_string(), path.clone(), state.config.capture_max_bytes);
    recorder.capture_request_body(&body);

    let query_pairs = sorted_query_pairs(uri.query());
    let body_digest = *blake3::hash(&body).as_bytes();

    // CACHE_CHECK: a cache lookup needs the authenticated project scope,
    // so it performs a non-tracking validation first. This is still
    // cheaper than the tracked path: it never touches the rate limiter
    // or the usage-counter write.
    if method == Method::GET && state.config.cache.cache_enabled {
        if let Some(response) = try_cache_hit(&state, &token_secret, &method, &path, &query_pairs, &headers, &body_digest).await? {
            let event = recorder.finish(
                Some(response.project_id),
                Some(response.token_id),
                response.cached.status,
                true,
                Some(&response.cached.body),
                false,
                response.cached.headers.clone(),
            );
            crate::instrumentation::emit(&state.bus, event).await;
            return Ok(cached_response_into_http(response.cached, request_id, &response.fingerprint));
        }
    }

    // MISS: admit against the token's own request budget.
    let validated = state.validator.validate_and_track(&token_secret).await.map_err(map_validation_error)?;

    let project = state
        .project_store
        .get(validated.project_id)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or_else(|| ProxyError::Unauthorized("token references an unknown project".to_string()))?;

    if state.config.enforce_project_active && !project.is_active {
        return Err(ProxyError::Forbidden("project_inactive".to_string()));
    }

    let decision = state
        .rate_limiter
        .allow(
            &validated.token_id.to_string(),
            state.config.rate_limit_max,
            state.config.rate_limit_window,
            chrono::Utc::now(),
        )
        .await;
    if let crate::ratelimit::Decision::Denied { retry_after, limit } = decision {
        return Err(ProxyError::RateLimited {
            detail: format!("rate limit of {limit} requests exceeded"),
            retry_after,
        });
    }

    if let Some(whitelist_error) = check_param_whitelist(&state, &path, &body) {
        return Err(ProxyError::BadRequest(whitelist_error));
    }

    let (_, provider) = state
        .default_provider()
        .ok_or_else(|| ProxyError::Internal("no upstream provider configured".to_string()))?;
    let header_prefix = provider.header_prefix.clone();

    let mut upstream_key = project.upstream_api_key.clone();
    let upstream_request = build_upstream_request(&state, &provider.target_base_url, &method, &uri, &headers, &upstream_key, body.clone())?;
    upstream_key.zeroize();

    let upstream_response = match tokio::time::timeout(state.config.request_timeout, state.http_client.execute(upstream_request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => return Err(ProxyError::UpstreamTransport(error.to_string())),
        Err(_elapsed) => return Err(ProxyError::UpstreamTimeout(format!("no response within {:?}", state.config.request_timeout))),
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();

    // A genuine streaming response (SSE) is forwarded chunk-by-chunk
    // without ever materializing the full body in memory — the headers
    // (and therefore any body-derived metadata headers) must already be
    // on the wire before the first chunk is known, so metadata
    // extraction is skipped for this path; it still applies to the
    // bounded, non-streaming responses handled below.
    if is_event_stream(&response_headers) {
        return stream_upstream_response(
            &state,
            upstream_response,
            status,
            &response_headers,
            recorder,
            project.id,
            validated.token_id,
            request_id,
        );
    }

    let cache_control = response_headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut tee = CappedTee::new(state.config.capture_max_bytes);
    let mut upstream_bytes = Vec::new();
    let mut stream = upstream_response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProxyError::UpstreamTransport(e.to_string()))?;
        tee.observe(&chunk);
        upstream_bytes.extend_from_slice(&chunk);
    }

    let metadata = super::metadata::extract(tee.captured());
    let metadata_headers = metadata.into_headers(&header_prefix);

    let mut response_header_pairs: Vec<(String, String)> = response_headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    response_header_pairs.extend(metadata_headers.iter().cloned());

    if state.config.cache.cache_enabled && method == Method::GET {
        let vary_values = vary_header_values(&state, &headers);
        let fp = fingerprint(&CacheKeyParts {
            method: method.as_str(),
            path: &path,
            sorted_query: &query_pairs,
            body_digest: &body_digest,
            vary_values: &vary_values,
            project_id: project.id,
        });
        let ttl = cache_control
            .as_deref()
            .and_then(max_age_from_cache_control)
            .unwrap_or_else(|| state.config.cache.cache_default_ttl);
        let cached = CachedResponse {
            status: status.as_u16(),
            headers: response_header_pairs.clone(),
            body: tee.captured().to_vec(),
            cached_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        };
        state
            .response_cache
            .put(fp, cached, state.config.cache.cache_max_bytes as usize);
    }

    let event = recorder.finish(
        Some(project.id),
        Some(validated.token_id),
        status.as_u16(),
        false,
        Some(tee.captured()),
        tee.truncated(),
        response_header_pairs.clone(),
    );
    crate::instrumentation::emit(&state.bus, event).await;

    let mut response = Response::builder().status(status.as_u16());
    for (name, value) in &response_header_pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            response = response.header(name, value);
        }
    }
    response = response.header(REQUEST_ID_HEADER, request_id.to_string());
    response
        .body(Body::from(upstream_bytes))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

struct CacheHitResponse {
    project_id: Uuid,
    token_id: Uuid,
    cached: CachedResponse,
    fingerprint: [u8; 32],
}

/// Resolve project scope via a non-tracking validation, then look the
/// fingerprint up in the response cache. On a hit, records the cache
/// hit against the token (never the request counter) and returns the
/// cached response; on a miss, returns `None` so the caller proceeds
/// down the tracked admission path.
async fn try_cache_hit(
    state: &Arc<AppState>,
    token_secret: &str,
    method: &Method,
    path: &str,
    query_pairs: &[(String, String)],
    headers: &HeaderMap,
    body_digest: &[u8; 32],
) -> Result<Option<CacheHitResponse>, ProxyError> {
    let validated = match state.validator.validate(token_secret).await {
        Ok(validated) => validated,
        Err(_) => return Ok(None),
    };

    let vary_values = vary_header_values(state, headers);
    let fp = fingerprint(&CacheKeyParts {
        method: method.as_str(),
        path,
        sorted_query: query_pairs,
        body_digest,
        vary_values: &vary_values,
        project_id: validated.project_id,
    });

    let Some(cached) = state.response_cache.get(&fp) else {
        return Ok(None);
    };

    state
        .validator
        .record_cache_hit(validated.token_id)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

    Ok(Some(CacheHitResponse {
        project_id: validated.project_id,
        token_id: validated.token_id,
        cached,
        fingerprint: fp,
    }))
}

/// Whether the upstream response is a Server-Sent-Events stream, the
/// one response shape this proxy forwards without buffering.
fn is_event_stream(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|value| value.starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Forward an SSE upstream response to the client as it arrives. The
/// response headers go out immediately; a background task drives the
/// upstream byte stream into a channel the client body reads from,
/// teeing a size-capped copy for the event it emits once the stream
/// ends. Never cached (spec's cache policy applies to bounded,
/// idempotent responses, not open streams).
fn stream_upstream_response(
    state: &Arc<AppState>,
    upstream_response: reqwest::Response,
    status: reqwest::StatusCode,
    response_headers: &reqwest::header::HeaderMap,
    recorder: RequestRecorder,
    project_id: Uuid,
    token_id: Uuid,
    request_id: Uuid,
) -> Result<Response, ProxyError> {
    let response_header_pairs: Vec<(String, String)> = response_headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();

    let capture_cap = state.config.capture_max_bytes;
    let bus = Arc::clone(&state.bus);
    let forward_headers = response_header_pairs.clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    tokio::spawn(async move {
        let mut tee = CappedTee::new(capture_cap);
        let mut stream = upstream_response.bytes_stream();
        let mut client_gone = false;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    tee.observe(&bytes);
                    if !client_gone && tx.send(Ok(bytes)).await.is_err() {
                        // Client disconnected; keep draining upstream so
                        // the event below still reflects what upstream
                        // actually sent, but stop trying to forward.
                        client_gone = true;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "upstream stream error mid-flight");
                    break;
                }
            }
        }
        drop(tx);

        let event = recorder.finish(
            Some(project_id),
            Some(token_id),
            status.as_u16(),
            false,
            Some(tee.captured()),
            tee.truncated(),
            forward_headers,
        );
        crate::instrumentation::emit(&bus, event).await;
    });

    let body_stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });

    let mut response = Response::builder().status(status.as_u16());
    for (name, value) in &response_header_pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            response = response.header(name, value);
        }
    }
    response = response.header(REQUEST_ID_HEADER, request_id.to_string());
    response
        .body(Body::from_stream(body_stream))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

fn vary_header_values(state: &Arc<AppState>, headers: &HeaderMap) -> Vec<Option<String>> {
    state
        .config
        .cache
        .vary_headers
        .iter()
        .map(|name| headers.get(name.as_str()).and_then(|v| v.to_str().ok()).map(str::to_string))
        .collect()
}

fn cached_response_into_http(cached: CachedResponse, request_id: Uuid, fingerprint: &[u8; 32]) -> Response {
    let mut builder = Response::builder().status(cached.status);
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            builder = builder.header(name, value);
        }
    }
    builder = builder
        .header("cache-status", "llm-proxy; hit")
        .header("x-proxy-cache", "hit")
        .header("x-proxy-cache-key", encode_hex(fingerprint))
        .header(REQUEST_ID_HEADER, request_id.to_string());
    builder.body(Body::from(cached.body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Lower-case hex encoding for the cache fingerprint header. A one-off
/// helper rather than pulling in the `hex` crate for a single 32-byte value.
fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn inbound_or_new_request_id(headers: &HeaderMap) -> Uuid {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

fn map_validation_error(error: ValidationError) -> ProxyError {
    match error {
        ValidationError::InvalidFormat => ProxyError::Unauthorized("malformed bearer token".to_string()),
        ValidationError::NotFound => ProxyError::Unauthorized("unknown token".to_string()),
        ValidationError::Inactive => ProxyError::Unauthorized("token has been revoked".to_string()),
        ValidationError::Expired => ProxyError::Unauthorized("token has expired".to_string()),
        ValidationError::RateLimited => ProxyError::RateLimited {
            detail: "token has exhausted its request budget".to_string(),
            retry_after: 0,
        },
        ValidationError::Storage(detail) => ProxyError::StoreUnavailable(detail),
    }
}

fn check_param_whitelist(state: &Arc<AppState>, path: &str, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    state.param_whitelist.check(path, &value).err()
}

fn build_upstream_request(
    state: &Arc<AppState>,
    target_base_url: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    upstream_key: &str,
    body: Bytes,
) -> Result<reqwest::Request, ProxyError> {
    let mut url = reqwest::Url::parse(target_base_url).map_err(|e| ProxyError::Internal(e.to_string()))?;
    url.set_path(uri.path());
    url.set_query(uri.query());

    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|e| ProxyError::Internal(e.to_string()))?;

    let mut builder = state.http_client.request(reqwest_method, url);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }
    builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {upstream_key}"));

    builder.body(body).build().map_err(|e| ProxyError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token_from_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("sk-abc"));
    }

    #[test]
    fn rejects_non_bearer_authorization_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn maps_validation_errors_to_the_spec_defined_status_family() {
        assert_eq!(map_validation_error(ValidationError::NotFound).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(map_validation_error(ValidationError::RateLimited).status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(map_validation_error(ValidationError::Storage("x".into())).status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
