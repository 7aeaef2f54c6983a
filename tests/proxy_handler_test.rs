//! End-to-end exercises of `proxy_handler` against a mocked upstream,
//! covering the scenarios spec.md section 8 calls out by name: a happy
//! path, an unauthenticated request, an inactive project, a
//! rate-limited token, and a response-cache hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::any;
use axum::Router;
use chrono::Utc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_proxy::bus::memory::InMemoryBus;
use llm_proxy::bus::Bus;
use llm_proxy::config::{CacheConfig, ProviderConfig, ProxyConfig};
use llm_proxy::model::{Project, Token};
use llm_proxy::proxy::handler::proxy_handler;
use llm_proxy::proxy::pool;
use llm_proxy::proxy::whitelist::ParamWhitelist;
use llm_proxy::proxy::AppState;
use llm_proxy::ratelimit::memory::InMemoryRateLimiter;
use llm_proxy::ratelimit::RateLimiter;
use llm_proxy::respcache::ResponseCache;
use llm_proxy::store::memory::{InMemoryProjectStore, InMemoryTokenStore};

async fn build_state(upstream: &MockServer, cache_enabled: bool) -> (Arc<AppState>, Arc<InMemoryTokenStore>, Arc<InMemoryProjectStore>) {
    let mut config = ProxyConfig::default();
    config.providers.insert(
        "openai".to_string(),
        ProviderConfig {
            target_base_url: upstream.uri(),
            header_prefix: "OpenAI".to_string(),
        },
    );
    config.allowed_endpoints = vec!["/v1/".to_string()];
    config.allowed_methods = vec!["GET".to_string(), "POST".to_string()];
    config.cache = CacheConfig {
        cache_enabled,
        ..CacheConfig::default()
    };
    config.rate_limit_max = 2;
    config.rate_limit_window = Duration::from_secs(60);

    let token_store = Arc::new(InMemoryTokenStore::new());
    let project_store = Arc::new(InMemoryProjectStore::new());
    let validator = Arc::new(llm_proxy::validator::cache::CachedValidator::new(Arc::clone(&token_store)));
    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());
    let response_cache = Arc::new(ResponseCache::new(config.cache.cache_max_entries, config.cache.cache_default_ttl));
    let param_whitelist = Arc::new(ParamWhitelist::compile(&HashMap::new()).unwrap());
    let http_client = pool::build_client(&config.pool, config.request_timeout).unwrap();
    let bus = Arc::new(Bus::InMemory(Arc::new(InMemoryBus::new())));

    let state = Arc::new(AppState {
        config: Arc::new(config),
        validator,
        project_store: project_store.clone(),
        rate_limiter,
        response_cache,
        bus,
        http_client,
        param_whitelist,
    });

    (state, token_store, project_store)
}

fn seed_project_and_token(
    token_store: &InMemoryTokenStore,
    project_store: &InMemoryProjectStore,
    is_active: bool,
    max_requests: Option<u64>,
) -> (Uuid, String) {
    let project = Project {
        id: Uuid::now_v7(),
        name: "test-project".to_string(),
        upstream_api_key: "sk-real-upstream-key".to_string(),
        is_active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let project_id = project.id;
    project_store.insert(project);

    let token = Token {
        id: Uuid::now_v7(),
        secret: Token::generate_secret(),
        project_id,
        expires_at: None,
        is_active: true,
        request_count: 0,
        max_requests,
        cache_hit_count: 0,
        created_at: Utc::now(),
        last_used_at: None,
    };
    let secret = token.secret.clone();
    token_store.insert(token);

    (project_id, secret)
}

fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/*path", any(proxy_handler)).with_state(state)
}

#[tokio::test]
async fn a_valid_token_forwards_to_upstream_and_substitutes_the_real_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"model": "gpt-4", "usage": {"prompt_tokens": 3, "completion_tokens": 7, "total_tokens": 10}})),
        )
        .mount(&upstream)
        .await;

    let (state, token_store, project_store) = build_state(&upstream, true).await;
    let (_project_id, secret) = seed_project_and_token(&token_store, &project_store, true, None);

    let app = router(state);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from("{\"model\":\"gpt-4\"}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let forwarded_auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert_eq!(forwarded_auth, "Bearer sk-real-upstream-key");
}

#[tokio::test]
async fn a_missing_bearer_token_is_unauthorized_without_touching_upstream() {
    let upstream = MockServer::start().await;
    let (state, _token_store, _project_store) = build_state(&upstream, true).await;

    let app = router(state);
    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn an_inactive_project_is_forbidden() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({}))).mount(&upstream).await;

    let (state, token_store, project_store) = build_state(&upstream, true).await;
    let (_project_id, secret) = seed_project_and_token(&token_store, &project_store, false, None);

    let app = router(state);
    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", format!("Bearer {secret}"))
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn exceeding_the_token_budget_yields_rate_limited() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({}))).mount(&upstream).await;

    let (state, token_store, project_store) = build_state(&upstream, true).await;
    let (_project_id, secret) = seed_project_and_token(&token_store, &project_store, true, Some(1));

    let app = router(state);

    let first = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", format!("Bearer {secret}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(first).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let second = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", format!("Bearer {secret}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn a_repeated_get_is_served_from_cache_without_a_second_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&upstream)
        .await;

    let (state, token_store, project_store) = build_state(&upstream, true).await;
    let (_project_id, secret) = seed_project_and_token(&token_store, &project_store, true, None);

    let app = router(state);

    let mut last_response = None;
    for _ in 0..2 {
        let request = Request::builder()
            .method("GET")
            .uri("/v1/models")
            .header("authorization", format!("Bearer {secret}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        last_response = Some(response);
    }

    upstream.verify().await;

    let cache_hit = last_response.unwrap();
    assert_eq!(cache_hit.headers().get("x-proxy-cache").unwrap(), "hit");
    assert!(cache_hit.headers().contains_key("x-proxy-cache-key"));
    assert!(cache_hit.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn a_server_sent_events_response_is_forwarded_byte_for_byte() {
    let upstream = MockServer::start().await;
    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let (state, token_store, project_store) = build_state(&upstream, true).await;
    let (_project_id, secret) = seed_project_and_token(&token_store, &project_store, true, None);

    let app = router(state);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from("{\"model\":\"gpt-4\",\"stream\":true}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), sse_body.as_bytes());
}
