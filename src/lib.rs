//! Resilience Core Library
//!
//! Failure-handling building blocks for services that call flaky
//! dependencies and admit untrusted traffic.
//!
//! # Features
//!
//! - **Backoff**: exponential (with jitter), constant and linear schedules
//! - **Retry**: cancellable retry loop over any async operation
//! - **Circuit Breaker**: three-state breaker with rolling windows and generations
//! - **Rate Limiting**: quota-store-backed limiter gated by a breaker, fail-open by default
//! - **Client Identity**: spoof-resistant client IP resolution behind trusted proxies
//! - **HTTP**: axum middleware that applies limiter decisions and quota headers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod security;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
