//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::failsafe::{KeyStrategy, StoreFailurePolicy};
use crate::{Error, Result};

/// Environment variable prefix for overrides (`RESILIENCE_RETRY__MAX_ATTEMPTS=5`)
pub const ENV_PREFIX: &str = "RESILIENCE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Missing files are skipped.
    pub env_files: Vec<String>,
    /// Demo server configuration
    pub server: ServerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Circuit breaker guarding the quota store
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Env files feed the environment overrides, so they load before extraction
        let env_files: Vec<String> = figment
            .clone()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract_inner("env_files")
            .unwrap_or_default();
        load_env_files(&env_files);

        Self::from_figment(figment)
    }

    /// Merge environment overrides into `figment`, extract and validate.
    pub(crate) fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component misbehave at call time.
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if !(cb.failure_ratio > 0.0 && cb.failure_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "circuit_breaker.failure_ratio must be in (0, 1], got {}",
                cb.failure_ratio
            )));
        }
        if cb.half_open_max_requests == 0 {
            return Err(Error::Config(
                "circuit_breaker.half_open_max_requests must be at least 1".to_string(),
            ));
        }
        if cb.open_duration.is_zero() {
            return Err(Error::Config(
                "circuit_breaker.open_duration must be positive".to_string(),
            ));
        }

        let rl = &self.rate_limit;
        if rl.enabled {
            if rl.limit == 0 {
                return Err(Error::Config(
                    "rate_limit.limit must be positive".to_string(),
                ));
            }
            if rl.window.is_zero() {
                return Err(Error::Config(
                    "rate_limit.window must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
/// Variables already set in the environment are not overwritten.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
            (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
            _ => path_str.clone(),
        };

        let path = Path::new(&expanded);
        if !path.exists() {
            tracing::debug!("Env file not found (skipped): {expanded}");
            continue;
        }
        match dotenvy::from_path(path) {
            Ok(()) => tracing::info!("Loaded env file: {expanded}"),
            Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
        }
    }
}

/// Demo server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying)
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Which backoff strategy to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `min * factor^attempt`, capped, optionally jittered
    #[default]
    Exponential,
    /// Fixed delay
    Constant,
    /// `increment * (attempt + 1)`, capped
    Linear,
}

/// Backoff configuration. Only the fields relevant to `type` are used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Strategy type
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Exponential: first delay
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Exponential and linear: cap
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Exponential: growth factor
    pub factor: f64,
    /// Exponential: randomize delays
    pub jitter: bool,
    /// Constant: the delay
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Linear: growth per attempt
    #[serde(with = "humantime_serde")]
    pub increment: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
            delay: Duration::from_secs(1),
            increment: Duration::from_secs(1),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Name used in logs and status messages
    pub name: String,
    /// Failure ratio in the current window that trips the breaker
    pub failure_ratio: f64,
    /// Requests needed in the window before the ratio is evaluated
    pub minimum_requests: u32,
    /// Length of the rolling window while closed (0 = never cleared)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long the breaker stays open before probing
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
    /// Trial calls allowed while half-open; as many consecutive successes close it
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "quota-store".to_string(),
            failure_ratio: 0.6,
            minimum_requests: 3,
            interval: Duration::from_secs(10),
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Prefix for every key sent to the quota store
    pub namespace: String,
    /// CIDR ranges allowed to set `X-Forwarded-For`
    pub trusted_proxies: Vec<String>,
    /// What to do when the quota store cannot answer
    pub store_failure_policy: StoreFailurePolicy,
    /// Deadline for one quota store call (0 = none)
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
    /// Requests allowed per window
    pub limit: u32,
    /// Quota window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Burst capacity (0 = same as limit)
    pub burst: u32,
    /// How requests are grouped into quota keys
    pub key: KeyStrategy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "ratelimit:".to_string(),
            trusted_proxies: Vec::new(),
            store_failure_policy: StoreFailurePolicy::FailOpen,
            store_timeout: Duration::from_secs(1),
            limit: 100,
            window: Duration::from_secs(60),
            burst: 0,
            key: KeyStrategy::ByIp,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (`"30s"`, or `"250ms"`
    /// when not a whole number of seconds)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" first: it also ends in 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m.saturating_mul(60)))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .trim()
                .parse::<u64>()
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
