//! HTTP middleware tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware,
    response::Response,
    routing::get,
};
use resilience_core::config::{CircuitBreakerConfig, RateLimitConfig};
use resilience_core::failsafe::{
    MemoryQuotaStore, QuotaOutcome, QuotaStore, RateLimitRule, RateLimiter, StoreError,
    StoreFailurePolicy,
};
use resilience_core::gateway::{
    AppState, AuthenticatedUser, RateLimitState, create_router, rate_limit_middleware,
};
use serde_json::Value;
use tower::ServiceExt;

struct DownStore;

#[async_trait]
impl QuotaStore for DownStore {
    async fn check_and_consume(
        &self,
        _key: &str,
        _limit: u32,
        _window: Duration,
        _burst: u32,
    ) -> Result<QuotaOutcome, StoreError> {
        Err(StoreError::Unavailable("refused".to_string()))
    }
}

fn limiter(policy: StoreFailurePolicy, store: Arc<dyn QuotaStore>) -> Arc<RateLimiter> {
    let config = RateLimitConfig {
        trusted_proxies: vec!["10.0.0.0/8".to_string()],
        store_failure_policy: policy,
        ..RateLimitConfig::default()
    };
    Arc::new(RateLimiter::new(
        &config,
        &CircuitBreakerConfig::default(),
        Some(store),
    ))
}

fn app(limiter: Arc<RateLimiter>, limit: u32) -> Router {
    let rule = RateLimitRule::global(limit, Duration::from_secs(60), 0).unwrap();
    Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(
            RateLimitState::new(limiter, rule),
            rate_limit_middleware,
        ))
}

fn request(peer: &str, path: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().unwrap();
    Request::builder()
        .uri(path)
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap()
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_allowed_request_carries_quota_headers() {
    let app = app(
        limiter(StoreFailurePolicy::FailOpen, Arc::new(MemoryQuotaStore::new())),
        5,
    );

    let response = app.oneshot(request("198.51.100.7:4000", "/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("5"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("4"));
    assert!(header(&response, "x-ratelimit-reset").is_some());
    assert!(header(&response, "retry-after").is_none());
}

#[tokio::test]
async fn test_exhausted_quota_returns_429() {
    let app = app(
        limiter(StoreFailurePolicy::FailOpen, Arc::new(MemoryQuotaStore::new())),
        1,
    );

    let first = app.clone().oneshot(request("198.51.100.7:4000", "/")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(request("198.51.100.7:4001", "/")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&second, "x-ratelimit-remaining"), Some("0"));
    assert_eq!(header(&second, "retry-after"), Some("60"));

    let body = json_body(second).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["retry_after"], 60.0);
}

#[tokio::test]
async fn test_store_outage_fails_open_without_headers() {
    let app = app(limiter(StoreFailurePolicy::FailOpen, Arc::new(DownStore)), 5);

    let response = app.oneshot(request("198.51.100.7:4000", "/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-ratelimit-limit").is_none());
}

#[tokio::test]
async fn test_store_outage_fail_closed_returns_503() {
    let app = app(limiter(StoreFailurePolicy::FailClosed, Arc::new(DownStore)), 5);

    let response = app.oneshot(request("198.51.100.7:4000", "/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(header(&response, "retry-after").is_none());
    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limiter_unavailable");
}

#[tokio::test]
async fn test_forwarded_client_from_trusted_proxy_gets_own_quota() {
    let app = app(
        limiter(StoreFailurePolicy::FailOpen, Arc::new(MemoryQuotaStore::new())),
        1,
    );
    let via_proxy = |client: &str| {
        let mut req = request("10.0.0.5:8080", "/");
        req.headers_mut()
            .insert("x-forwarded-for", client.parse().unwrap());
        req
    };

    let a = app.clone().oneshot(via_proxy("203.0.113.9")).await.unwrap();
    let b = app.clone().oneshot(via_proxy("203.0.113.10")).await.unwrap();
    let a_again = app.oneshot(via_proxy("203.0.113.9")).await.unwrap();

    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_authenticated_user_extension_drives_per_user_keys() {
    let limiter = limiter(StoreFailurePolicy::FailOpen, Arc::new(MemoryQuotaStore::new()));
    let rule = RateLimitRule::per_user(1, Duration::from_secs(60), 0).unwrap();
    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(
            RateLimitState::new(limiter, rule),
            rate_limit_middleware,
        ));
    let as_user = |user: &str| {
        let mut req = request("198.51.100.7:4000", "/");
        req.extensions_mut().insert(AuthenticatedUser(user.to_string()));
        req
    };

    assert_eq!(app.clone().oneshot(as_user("alice")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(app.clone().oneshot(as_user("bob")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        app.oneshot(as_user("alice")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_health_is_not_rate_limited() {
    let limiter = limiter(StoreFailurePolicy::FailOpen, Arc::new(MemoryQuotaStore::new()));
    let rule = RateLimitRule::global(1, Duration::from_secs(60), 0).unwrap();
    let app = create_router(
        Arc::new(AppState {
            limiter: Arc::clone(&limiter),
        }),
        RateLimitState::new(limiter, rule),
    );

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(request("198.51.100.7:4000", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["circuit_breaker"]["state"], "closed");
        assert_eq!(body["rate_limiting"], true);
    }

    let first = app.clone().oneshot(request("198.51.100.7:4000", "/anything")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(json_body(first).await["path"], "/anything");

    let limited = app.oneshot(request("198.51.100.7:4000", "/")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
}
