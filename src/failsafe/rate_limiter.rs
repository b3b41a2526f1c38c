//! Rate limiting implementation
//!
//! Admission runs the quota store call through the circuit breaker. When the
//! store cannot answer, [`StoreFailurePolicy`] decides: fail-open (default)
//! lets the request through without quota metadata, fail-closed refuses it as
//! unavailable. Either way a `quota_store_unavailable` event is recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circuit_breaker::{BreakerError, CircuitBreaker};
use super::quota_store::{QuotaOutcome, QuotaStore, StoreError};
use crate::config::{CircuitBreakerConfig, RateLimitConfig};
use crate::security::client_ip::{self, ClientIdentity, TrustedProxies};
use crate::security::events::{EventSink, SecurityEvent, TracingEventSink, UnavailableCause};
use crate::{Error, Result};

/// Key used when a strategy produces an empty string
const DEFAULT_KEY: &str = "default";

/// Behavior when the quota store cannot be consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Allow the request without quota metadata
    #[default]
    FailOpen,
    /// Refuse the request as unavailable
    FailClosed,
}

/// How requests are grouped into quota keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Resolved client IP
    ByIp,
    /// `user:<id>`, or the client IP for anonymous requests
    ByUser,
    /// `route:<route>:<ip>`
    ByRoute(String),
    /// Parts of several strategies joined with `:`
    Composite(Vec<KeyStrategy>),
}

impl KeyStrategy {
    fn key(&self, request: &RequestInfo, identity: &ClientIdentity) -> String {
        match self {
            Self::ByIp => identity.ip.clone(),
            Self::ByUser => request
                .user_id
                .as_deref()
                .filter(|u| !u.is_empty())
                .map_or_else(|| identity.ip.clone(), |u| format!("user:{u}")),
            Self::ByRoute(route) => format!("route:{route}:{}", identity.ip),
            Self::Composite(parts) => parts
                .iter()
                .map(|p| p.key(request, identity))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }
}

/// The parts of an inbound request the limiter needs
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Transport peer address, with or without port
    pub peer_addr: String,
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    /// Request path
    pub path: String,
    /// Authenticated user, if any
    pub user_id: Option<String>,
}

impl RequestInfo {
    /// Request from `peer_addr` for `path`
    pub fn new(peer_addr: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the forwarded header value
    #[must_use]
    pub fn forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Set the authenticated user
    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Quota applied to a group of requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    limit: u32,
    window: Duration,
    burst: u32,
    key: KeyStrategy,
}

impl RateLimitRule {
    /// `limit` requests per `window`, with up to `burst` at once (0 = `limit`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRule`] for a zero limit or window.
    pub fn new(limit: u32, window: Duration, burst: u32, key: KeyStrategy) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidRule("limit must be positive".to_string()));
        }
        if window.is_zero() {
            return Err(Error::InvalidRule("window must be positive".to_string()));
        }
        if let KeyStrategy::Composite(parts) = &key
            && parts.is_empty()
        {
            return Err(Error::InvalidRule(
                "composite key needs at least one part".to_string(),
            ));
        }
        Ok(Self {
            limit,
            window,
            burst,
            key,
        })
    }

    /// Per-client-IP rule
    pub fn global(limit: u32, window: Duration, burst: u32) -> Result<Self> {
        Self::new(limit, window, burst, KeyStrategy::ByIp)
    }

    /// Per-user rule, falling back to client IP
    pub fn per_user(limit: u32, window: Duration, burst: u32) -> Result<Self> {
        Self::new(limit, window, burst, KeyStrategy::ByUser)
    }

    /// Per-route, per-client-IP rule
    pub fn per_route(
        route: impl Into<String>,
        limit: u32,
        window: Duration,
        burst: u32,
    ) -> Result<Self> {
        Self::new(limit, window, burst, KeyStrategy::ByRoute(route.into()))
    }

    /// Rule described by the `rate_limit` config section
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        Self::new(config.limit, config.window, config.burst, config.key.clone())
    }

    /// Requests allowed per window
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Quota window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Burst capacity
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Key strategy
    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }
}

/// Quota metadata for response headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaInfo {
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left, in `[0, limit]`
    pub remaining: u32,
    /// When the quota is replenished
    pub reset_at: DateTime<Utc>,
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Limiting is disabled or no store is attached
    Bypassed,
    /// The store admitted the request
    WithinQuota,
    /// The store refused the request
    QuotaExceeded,
    /// The store could not answer
    StoreUnavailable,
}

/// Outcome of admitting one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Why
    pub reason: DecisionReason,
    /// Present only when the store answered
    pub quota: Option<QuotaInfo>,
    /// Present only when denied by quota
    #[serde(with = "retry_after_secs")]
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn bypassed() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Bypassed,
            quota: None,
            retry_after: None,
        }
    }

    fn unavailable(policy: StoreFailurePolicy) -> Self {
        Self {
            allowed: policy == StoreFailurePolicy::FailOpen,
            reason: DecisionReason::StoreUnavailable,
            quota: None,
            retry_after: None,
        }
    }

    fn from_outcome(outcome: QuotaOutcome, limit: u32) -> Self {
        let retry_after = (!outcome.allowed).then(|| {
            outcome.retry_after.unwrap_or_else(|| {
                (outcome.reset_at - Utc::now())
                    .to_std()
                    .unwrap_or_default()
            })
        });
        Self {
            allowed: outcome.allowed,
            reason: if outcome.allowed {
                DecisionReason::WithinQuota
            } else {
                DecisionReason::QuotaExceeded
            },
            quota: Some(QuotaInfo {
                limit,
                remaining: outcome.remaining.min(limit),
                reset_at: outcome.reset_at,
            }),
            retry_after,
        }
    }

    /// Response headers to attach: `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
    /// `X-RateLimit-Reset` (Unix seconds) and, when denied by quota,
    /// `Retry-After` (whole seconds, rounded up). Empty when the store did not
    /// answer.
    #[must_use]
    pub fn header_values(&self) -> Vec<(&'static str, String)> {
        let Some(quota) = &self.quota else {
            return Vec::new();
        };
        let mut headers = vec![
            ("X-RateLimit-Limit", quota.limit.to_string()),
            ("X-RateLimit-Remaining", quota.remaining.to_string()),
            ("X-RateLimit-Reset", quota.reset_at.timestamp().to_string()),
        ];
        if let Some(wait) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(wait).to_string()));
        }
        headers
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

mod retry_after_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&super::ceil_secs(*d)),
            None => s.serialize_none(),
        }
    }
}

/// Circuit-breaker-gated rate limiter.
///
/// Shared through an `Arc` by every request handler.
pub struct RateLimiter {
    enabled: bool,
    namespace: String,
    store: Option<Arc<dyn QuotaStore>>,
    breaker: Arc<CircuitBreaker>,
    trusted_proxies: TrustedProxies,
    failure_policy: StoreFailurePolicy,
    store_timeout: Option<Duration>,
    events: Arc<dyn EventSink>,
}

impl RateLimiter {
    /// Create a new rate limiter. With `store` set to `None` every request is
    /// allowed.
    pub fn new(
        config: &RateLimitConfig,
        breaker: &CircuitBreakerConfig,
        store: Option<Arc<dyn QuotaStore>>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            namespace: config.namespace.clone(),
            store,
            breaker: Arc::new(CircuitBreaker::new(breaker)),
            trusted_proxies: TrustedProxies::parse(&config.trusted_proxies),
            failure_policy: config.store_failure_policy,
            store_timeout: (!config.store_timeout.is_zero()).then_some(config.store_timeout),
            events: Arc::new(TracingEventSink),
        }
    }

    /// Replace the event sink
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the circuit breaker guarding the store
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// The breaker guarding the store
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Whether requests are being limited at all
    pub fn is_active(&self) -> bool {
        self.enabled && self.store.is_some()
    }

    /// Resolve who `request` comes from using the configured trusted proxies
    pub fn identify(&self, request: &RequestInfo) -> ClientIdentity {
        client_ip::resolve(
            &request.peer_addr,
            request.forwarded_for.as_deref(),
            &self.trusted_proxies,
        )
    }

    /// Namespaced store key for `request` under `strategy`
    pub fn key_for(&self, request: &RequestInfo, strategy: &KeyStrategy) -> String {
        let identity = self.identify(request);
        self.namespaced(&strategy.key(request, &identity))
    }

    fn namespaced(&self, key: &str) -> String {
        let key = if key.is_empty() { DEFAULT_KEY } else { key };
        format!("{}{key}", self.namespace)
    }

    /// Decide whether `request` may proceed under `rule`.
    pub async fn admit(&self, request: &RequestInfo, rule: &RateLimitRule) -> RateLimitDecision {
        let Some(store) = self.store.as_ref().filter(|_| self.enabled) else {
            return RateLimitDecision::bypassed();
        };

        let identity = self.identify(request);
        if let Some(header) = &identity.spoofed_header {
            self.events.record(&SecurityEvent::IpSpoofingSuspected {
                peer: identity.ip.clone(),
                forwarded_for: header.clone(),
                path: request.path.clone(),
            });
        }

        let key = self.namespaced(&rule.key.key(request, &identity));
        let result = self
            .breaker
            .call(|| self.consume(store.as_ref(), &key, rule))
            .await;

        match result {
            Ok(outcome) => {
                let decision = RateLimitDecision::from_outcome(outcome, rule.limit);
                if decision.allowed {
                    debug!(key = %key, remaining = ?decision.quota.as_ref().map(|q| q.remaining), "Request within quota");
                } else {
                    self.events.record(&SecurityEvent::RateLimitExceeded {
                        ip: identity.ip,
                        path: request.path.clone(),
                        key,
                        limit: rule.limit,
                    });
                }
                decision
            }
            Err(err) => {
                let cause = match err {
                    BreakerError::Inner(e) => UnavailableCause::StoreError(e.to_string()),
                    BreakerError::Open { .. } | BreakerError::TooManyTrials { .. } => {
                        UnavailableCause::BreakerOpen
                    }
                };
                self.events.record(&SecurityEvent::QuotaStoreUnavailable {
                    ip: identity.ip,
                    path: request.path.clone(),
                    cause,
                    failed_open: self.failure_policy == StoreFailurePolicy::FailOpen,
                });
                RateLimitDecision::unavailable(self.failure_policy)
            }
        }
    }

    async fn consume(
        &self,
        store: &dyn QuotaStore,
        key: &str,
        rule: &RateLimitRule,
    ) -> std::result::Result<QuotaOutcome, StoreError> {
        let call = store.check_and_consume(key, rule.limit, rule.window, rule.burst);
        match self.store_timeout {
            Some(deadline) => tokio::time::timeout(deadline, call)
                .await
                .map_err(|_| StoreError::Timeout(deadline))?,
            None => call.await,
        }
    }
}
