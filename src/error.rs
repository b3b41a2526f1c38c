//! Error types for the resilience core

use std::io;

use thiserror::Error;

/// Result type alias for the resilience core
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors.
///
/// These cover construction-time failures. Call-time failures of the retry
/// executor, circuit breaker and quota store have their own types in
/// [`crate::failsafe`] so callers can tell them apart.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit rule rejected at construction
    #[error("Invalid rate limit rule: {0}")]
    InvalidRule(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
