//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, Uri},
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::middleware::{RateLimitState, rate_limit_middleware};
use crate::failsafe::{CircuitState, RateLimiter};

/// Shared application state
pub struct AppState {
    /// Rate limiter guarding every route except `/health`
    pub limiter: Arc<RateLimiter>,
}

/// Create the router. `/health` bypasses rate limiting so probes keep
/// working while clients are throttled.
pub fn create_router(state: Arc<AppState>, rate_limit: RateLimitState) -> Router {
    let limited = Router::new()
        .route("/", get(root_handler))
        .fallback(echo_handler)
        .layer(middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(limited)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn echo_handler(uri: Uri) -> impl IntoResponse {
    Json(json!({ "path": uri.path() }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breaker = state.limiter.breaker();
    let circuit = breaker.state();
    let healthy = circuit != CircuitState::Open;

    let response = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "rate_limiting": state.limiter.is_active(),
        "circuit_breaker": {
            "name": breaker.name(),
            "state": circuit.to_string(),
            "counts": breaker.counts(),
            "message": breaker.status_message(),
        }
    });

    if healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
