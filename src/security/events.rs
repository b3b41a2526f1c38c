//! Security and availability events emitted by the rate limiter.
//!
//! Events go to an [`EventSink`]. The default sink writes structured
//! `tracing` records at a level derived from severity and bumps a counter per
//! event type; tests swap in a recording sink.

use std::fmt;

use serde::Serialize;
use tracing::{error, warn};

/// How urgent an event is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Low,
    /// Worth a look
    Medium,
    /// Needs attention
    High,
    /// Likely attack
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Why the quota store could not answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum UnavailableCause {
    /// The circuit breaker refused the call
    BreakerOpen,
    /// The store call itself failed
    StoreError(String),
}

/// Something the rate limiter observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A request exceeded its quota
    RateLimitExceeded {
        /// Resolved client address
        ip: String,
        /// Request path
        path: String,
        /// Store key that ran out
        key: String,
        /// Configured limit
        limit: u32,
    },
    /// An untrusted peer sent a forwarded-address header
    IpSpoofingSuspected {
        /// Transport peer
        peer: String,
        /// Header value it sent
        forwarded_for: String,
        /// Request path
        path: String,
    },
    /// The quota store could not be consulted
    QuotaStoreUnavailable {
        /// Resolved client address
        ip: String,
        /// Request path
        path: String,
        /// Breaker rejection or store failure
        cause: UnavailableCause,
        /// Whether the request was let through anyway
        failed_open: bool,
    },
}

impl SecurityEvent {
    /// Event type name as emitted in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::IpSpoofingSuspected { .. } => "ip_spoofing_suspected",
            Self::QuotaStoreUnavailable { .. } => "quota_store_unavailable",
        }
    }

    /// Severity used to pick the log level
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::RateLimitExceeded { .. } => Severity::Medium,
            Self::IpSpoofingSuspected { .. } => Severity::Critical,
            Self::QuotaStoreUnavailable { cause, .. } => match cause {
                UnavailableCause::BreakerOpen => Severity::Medium,
                UnavailableCause::StoreError(_) => Severity::High,
            },
        }
    }
}

/// Receives events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Record one event
    fn record(&self, event: &SecurityEvent);
}

/// Writes events to `tracing` and counts them
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &SecurityEvent) {
        let name = event.name();
        let severity = event.severity();
        telemetry_metrics::counter!("security_events_total", "event" => name, "severity" => severity.to_string())
            .increment(1);

        match event {
            SecurityEvent::RateLimitExceeded {
                ip,
                path,
                key,
                limit,
            } => {
                warn!(event = name, %severity, ip = %ip, path = %path, key = %key, limit, "Rate limit exceeded");
            }
            SecurityEvent::IpSpoofingSuspected {
                peer,
                forwarded_for,
                path,
            } => {
                error!(
                    event = name,
                    %severity,
                    peer = %peer,
                    suspected_ip = %forwarded_for,
                    path = %path,
                    "Forwarded header from untrusted peer ignored"
                );
            }
            SecurityEvent::QuotaStoreUnavailable {
                ip,
                path,
                cause,
                failed_open,
            } => match cause {
                UnavailableCause::BreakerOpen => {
                    warn!(event = name, %severity, ip = %ip, path = %path, failed_open, "Quota store breaker open");
                }
                UnavailableCause::StoreError(detail) => {
                    error!(event = name, %severity, ip = %ip, path = %path, failed_open, error = %detail, "Quota store call failed");
                }
            },
        }
    }
}
