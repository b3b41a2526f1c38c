//! Backoff strategies: attempt number in, delay out.
//!
//! All three strategies are immutable after construction and carry no
//! per-sequence state, so one instance can be shared by any number of
//! concurrent retry sequences. Out-of-range construction inputs are corrected
//! to safe defaults instead of being rejected.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackoffConfig, BackoffKind};

/// Delay used when a minimum, fixed delay or increment is zero
const FALLBACK_DELAY: Duration = Duration::from_secs(1);

/// Growth factor used when the configured one would not grow
const FALLBACK_FACTOR: f64 = 2.0;

/// Computes the wait before a retry.
pub trait BackoffStrategy: fmt::Debug + Send + Sync {
    /// Delay before retry number `attempt` (0 for the first retry).
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Reset internal state. A no-op for the built-in strategies.
    fn reset(&self) {}
}

/// Exponential growth from `min` towards `max`, with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create an exponential strategy.
    ///
    /// A zero `min` becomes 1s, a `max` below `min` becomes `min`, and a
    /// `factor` that is not above 1.0 (or not finite) becomes 2.0.
    #[must_use]
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        let min = if min.is_zero() { FALLBACK_DELAY } else { min };
        let max = max.max(min);
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            FALLBACK_FACTOR
        };

        Self {
            min,
            max,
            factor,
            jitter,
        }
    }

    /// Delay for `attempt` before jitter: `min * factor^attempt`, capped at `max`.
    #[must_use]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let raw = self.min.as_secs_f64() * self.factor.powf(f64::from(attempt));
        // powf overflows to +inf for large attempts; min() folds that into the cap.
        // A cap near Duration::MAX rounds up in f64 and no longer converts back.
        Duration::try_from_secs_f64(raw.min(self.max.as_secs_f64())).unwrap_or(self.max)
    }

    /// Lower bound of the delay
    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Cap applied before jitter
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Whether jitter is applied
    #[must_use]
    pub fn jitter(&self) -> bool {
        self.jitter
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, true)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    /// Jitter scales the capped delay by a factor in `[0.5, 1.5)`, so a jittered
    /// delay can land up to 50% above `max`. Jittering after the cap keeps
    /// clients that all reached the ceiling from retrying in lockstep.
    fn next_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter {
            return capped;
        }
        let factor = 0.5 + rand::random::<f64>();
        Duration::try_from_secs_f64(capped.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

/// The same delay for every attempt.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    /// Create a constant strategy. A zero delay becomes 1s.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        let delay = if delay.is_zero() { FALLBACK_DELAY } else { delay };
        Self { delay }
    }
}

impl BackoffStrategy for ConstantBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Delay grows by `increment` per attempt, capped at `max`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    increment: Duration,
    max: Duration,
}

impl LinearBackoff {
    /// Create a linear strategy. A zero increment becomes 1s and a `max` below
    /// the increment becomes the increment.
    #[must_use]
    pub fn new(increment: Duration, max: Duration) -> Self {
        let increment = if increment.is_zero() {
            FALLBACK_DELAY
        } else {
            increment
        };
        Self {
            increment,
            max: max.max(increment),
        }
    }
}

impl BackoffStrategy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.increment
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max)
    }
}

impl BackoffConfig {
    /// Build the strategy this configuration describes
    #[must_use]
    pub fn build(&self) -> Arc<dyn BackoffStrategy> {
        match self.kind {
            BackoffKind::Exponential => Arc::new(ExponentialBackoff::new(
                self.min,
                self.max,
                self.factor,
                self.jitter,
            )),
            BackoffKind::Constant => Arc::new(ConstantBackoff::new(self.delay)),
            BackoffKind::Linear => Arc::new(LinearBackoff::new(self.increment, self.max)),
        }
    }
}
