//! Failsafe mechanisms: backoff, retry, circuit breaker, rate limiting

mod backoff;
mod circuit_breaker;
mod quota_store;
mod rate_limiter;
mod retry;

pub use backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff};
pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitState, Counts, StateChangeHook};
pub use quota_store::{MemoryQuotaStore, QuotaOutcome, QuotaStore, StoreError};
pub use rate_limiter::{
    DecisionReason, KeyStrategy, QuotaInfo, RateLimitDecision, RateLimitRule, RateLimiter,
    RequestInfo, StoreFailurePolicy,
};
pub use retry::{RetryError, RetryExecutor, RetryHook, RetryPolicy, with_retry};
