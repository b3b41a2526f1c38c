//! Retry logic with pluggable backoff
//!
//! The operation decides retryability by what it returns: any `Err` is
//! retried. Wrap permanent or non-idempotent failures so they return `Ok`
//! when retrying would be wrong.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::BackoffStrategy;
use crate::config::RetryConfig;

/// Why a retried operation did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Retrying was disabled (`max_attempts == 0`) and the only attempt failed
    #[error(transparent)]
    Failed(E),
    /// Every attempt failed
    #[error("maximum retry attempts reached ({attempts} attempts): {source}")]
    Exhausted {
        /// Invocations of the operation, first attempt included
        attempts: u32,
        /// Error from the last attempt
        source: E,
    },
    /// Cancelled between or during a backoff sleep
    #[error("retry cancelled at retry {attempt}")]
    Cancelled {
        /// Zero-based retry index that was about to run
        attempt: u32,
    },
}

impl<E> RetryError<E> {
    /// True if the caller cancelled, as opposed to the operation giving up
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The operation's last error, if any attempt ran to completion
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(e) | Self::Exhausted { source: e, .. } => Some(e),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Observer called before each retry with the retry index and previous error
pub type RetryHook<'a, E> = Box<dyn FnMut(u32, &E) + Send + 'a>;

/// Runs one retry sequence.
pub struct RetryExecutor<'a, E> {
    max_attempts: u32,
    strategy: &'a dyn BackoffStrategy,
    on_retry: Option<RetryHook<'a, E>>,
}

impl<'a, E: Display> RetryExecutor<'a, E> {
    /// `max_attempts` retries after the first call; 0 disables retrying.
    pub fn new(max_attempts: u32, strategy: &'a dyn BackoffStrategy) -> Self {
        Self {
            max_attempts,
            strategy,
            on_retry: None,
        }
    }

    /// Observe each retry. The hook cannot change control flow.
    #[must_use]
    pub fn on_retry(mut self, hook: impl FnMut(u32, &E) + Send + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Invoke `operation` until it succeeds, retries run out, or `cancel` fires.
    ///
    /// The operation runs at most `max_attempts + 1` times. Cancellation is
    /// checked before each retry and raced against each backoff sleep.
    pub async fn execute<T, F, Fut>(
        mut self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if self.max_attempts == 0 {
            return Err(RetryError::Failed(last_error));
        }

        debug!(
            max_attempts = self.max_attempts,
            error = %last_error,
            "Starting retry attempts"
        );

        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempt });
            }

            if let Some(hook) = self.on_retry.as_mut() {
                hook(attempt, &last_error);
            }

            let delay = self.strategy.next_delay(attempt);
            debug!(
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying after delay"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled { attempt }),
                () = tokio::time::sleep(delay) => {}
            }

            match operation().await {
                Ok(value) => {
                    debug!(
                        attempt = attempt + 1,
                        total_attempts = attempt + 2,
                        "Retry succeeded"
                    );
                    return Ok(value);
                }
                Err(e) => last_error = e,
            }
        }

        warn!(
            max_attempts = self.max_attempts,
            error = %last_error,
            "All retry attempts failed"
        );

        Err(RetryError::Exhausted {
            attempts: self.max_attempts.saturating_add(1),
            source: last_error,
        })
    }
}

/// Retry policy: how many retries and how long to wait between them
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Delay schedule
    pub strategy: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            strategy: config.backoff.build(),
        }
    }

    /// Create from an explicit strategy
    #[must_use]
    pub fn with_strategy(max_attempts: u32, strategy: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            max_attempts,
            strategy,
        }
    }
}

/// Execute an operation under `policy`, emitting a `retry_attempt` event per
/// retry tagged with `name`.
///
/// # Errors
///
/// See [`RetryExecutor::execute`].
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    RetryExecutor::new(policy.max_attempts, policy.strategy.as_ref())
        .on_retry(|attempt, error: &E| {
            debug!(
                event = "retry_attempt",
                operation = name,
                attempt,
                error = %error,
                "Retrying operation"
            );
            telemetry_metrics::counter!("retry_attempts_total", "operation" => name.to_string())
                .increment(1);
        })
        .execute(cancel, operation)
        .await
}
