//! Quota store contract and an in-process implementation
//!
//! The rate limiter only knows the [`QuotaStore`] trait. Production
//! deployments back it with a shared service; [`MemoryQuotaStore`] keeps
//! per-key token buckets in the process.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

/// Errors from a quota store call
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
    /// The call exceeded its deadline
    #[error("quota store call timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with an error
    #[error("quota store error: {0}")]
    Backend(String),
}

/// Result of one check-and-consume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaOutcome {
    /// Whether the request fits in the quota
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the quota is fully replenished
    pub reset_at: DateTime<Utc>,
    /// How long to wait before the next request can pass (denials only)
    pub retry_after: Option<Duration>,
}

/// A shared counter service that admits one request per call.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Consume one unit of quota for `key`, allowing `limit` requests per
    /// `window` with up to `burst` at once.
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst: u32,
    ) -> Result<QuotaOutcome, StoreError>;
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Keyed token buckets held in memory.
///
/// Capacity is `burst` (or `limit` when `burst` is 0), refilled at `limit`
/// tokens per `window`.
#[derive(Default)]
pub struct MemoryQuotaStore {
    buckets: DashMap<String, Bucket>,
}

impl MemoryQuotaStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True if no keys are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets untouched for longer than `idle`
    pub fn purge_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < idle);
    }

    fn consume(&self, key: &str, limit: u32, window: Duration, burst: u32) -> QuotaOutcome {
        let capacity = f64::from(if burst == 0 { limit } else { burst });
        let rate = f64::from(limit) / window.as_secs_f64();
        let now = Instant::now();

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let tokens = bucket.tokens;
        drop(bucket);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let remaining = (tokens.floor() as u32).min(limit);
        let until_full = secs_saturating(((capacity - tokens) / rate).max(0.0));
        let retry_after = (!allowed).then(|| secs_saturating(((1.0 - tokens) / rate).max(0.0)));

        QuotaOutcome {
            allowed,
            remaining,
            reset_at: reset_instant(Utc::now(), until_full),
            retry_after,
        }
    }
}

fn secs_saturating(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// `now + wait`, clamped to the latest representable timestamp
fn reset_instant(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        burst: u32,
    ) -> Result<QuotaOutcome, StoreError> {
        if limit == 0 || window.is_zero() {
            return Err(StoreError::Backend(format!(
                "invalid quota for '{key}': {limit} per {window:?}"
            )));
        }
        Ok(self.consume(key, limit, window, burst))
    }
}
