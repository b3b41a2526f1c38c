//! Rate limiting middleware for axum

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use crate::failsafe::{DecisionReason, RateLimitDecision, RateLimitRule, RateLimiter, RequestInfo};

/// Forwarded-address header consulted for trusted peers
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// State shared with [`rate_limit_middleware`]
#[derive(Clone)]
pub struct RateLimitState {
    /// Limiter consulted per request
    pub limiter: Arc<RateLimiter>,
    /// Rule applied to every request through this layer
    pub rule: Arc<RateLimitRule>,
}

impl RateLimitState {
    /// Pair a limiter with the rule it enforces
    pub fn new(limiter: Arc<RateLimiter>, rule: RateLimitRule) -> Self {
        Self {
            limiter,
            rule: Arc::new(rule),
        }
    }
}

/// Authenticated user id, inserted as a request extension by whatever runs
/// authentication ahead of this layer
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

/// Admit or refuse each request.
///
/// Denied requests get `429` with `Retry-After`; a fail-closed store outage
/// gets `503`. Quota headers are attached whenever the store answered.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let info = request_info(&request);
    let decision = state.limiter.admit(&info, &state.rule).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else if decision.reason == DecisionReason::StoreUnavailable {
        debug!(path = %info.path, "Rejecting request, quota store unavailable");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "rate_limiter_unavailable",
                "message": "Rate limiting is temporarily unavailable. Try again later."
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Try again later.",
                "retry_after": decision.retry_after.map(|d| d.as_secs_f64().ceil()),
            })),
        )
            .into_response()
    };

    apply_headers(&mut response, &decision);
    response
}

fn request_info(request: &Request<Body>) -> RequestInfo {
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let forwarded_for = request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|AuthenticatedUser(id)| id.clone());

    RequestInfo {
        peer_addr,
        forwarded_for,
        path: request.uri().path().to_string(),
        user_id,
    }
}

fn apply_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    for (name, value) in decision.header_values() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}
