//! Circuit breaker implementation
//!
//! ```text
//! Closed   → Open:     requests >= minimum_requests and failures/requests >= failure_ratio
//! Open     → HalfOpen: open_duration elapsed (checked on the next call)
//! HalfOpen → Closed:   half_open_max_requests consecutive successes
//! HalfOpen → Open:     any trial failure
//! ```
//!
//! Every transition, and every rollover of the closed-state window, starts a
//! new generation. A call records its outcome only if the generation it
//! started in is still current.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Why a call did not produce the operation's own result.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Breaker name
        name: String,
    },
    /// Half-open and all trial slots are taken; the operation was not invoked
    #[error("circuit breaker '{name}' is half-open and out of trial slots")]
    TooManyTrials {
        /// Breaker name
        name: String,
    },
    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the breaker refused the call without invoking the operation
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::TooManyTrials { .. })
    }

    /// The operation's error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Calls admitted
    pub requests: u32,
    /// Calls that succeeded
    pub total_successes: u32,
    /// Calls that failed
    pub total_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Failures since the last success
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Fraction of admitted calls that failed
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Observer invoked after each transition with `(name, from, to)`
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Closed: end of the current window. Open: end of the cooldown.
    expiry: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Circuit breaker protecting one resource.
///
/// All bookkeeping sits behind a single mutex that is never held across an
/// `.await`, so the breaker can be shared through an `Arc` by any number of
/// concurrent callers.
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    failure_ratio: f64,
    minimum_requests: u32,
    interval: Duration,
    open_duration: Duration,
    half_open_max_requests: u32,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeHook>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: config.name.clone(),
            enabled: config.enabled,
            failure_ratio: config.failure_ratio,
            minimum_requests: config.minimum_requests,
            interval: config.interval,
            open_duration: config.open_duration,
            half_open_max_requests: config.half_open_max_requests.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: window_end(now, config.interval),
                opened_at: None,
            }),
            on_state_change: None,
        }
    }

    /// Attach an observer for state transitions
    #[must_use]
    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] or [`BreakerError::TooManyTrials`]
    /// without invoking `operation` when the breaker refuses the call. If the
    /// returned future is dropped before `operation` completes, the call is
    /// recorded as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return operation().await.map_err(BreakerError::Inner);
        }

        let generation = self.before_call().map_err(|rejection| match rejection {
            Rejection::Open => BreakerError::Open {
                name: self.name.clone(),
            },
            Rejection::TooManyTrials => BreakerError::TooManyTrials {
                name: self.name.clone(),
            },
        })?;

        let mut guard = CallGuard {
            breaker: self,
            generation,
            settled: false,
        };
        let result = operation().await;
        guard.settle(result.is_ok());

        result.map_err(BreakerError::Inner)
    }

    /// Get current state, applying any time-based transition that is due
    pub fn state(&self) -> CircuitState {
        let (state, transitions) = {
            let mut inner = self.inner.lock();
            let mut transitions = Vec::new();
            self.current_state(&mut inner, Instant::now(), &mut transitions);
            (inner.state, transitions)
        };
        self.notify(&transitions);
        state
    }

    /// Snapshot of the current generation's counters
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// Human-readable status for diagnostics
    pub fn status_message(&self) -> String {
        if !self.enabled {
            return format!("Circuit breaker '{}' is closed (disabled)", self.name);
        }

        let state = self.state();
        let inner = self.inner.lock();
        match state {
            CircuitState::Closed => format!(
                "Circuit breaker '{}' is closed ({} failures in {} requests this window)",
                self.name, inner.counts.total_failures, inner.counts.requests
            ),
            CircuitState::Open => {
                let remaining = inner
                    .expiry
                    .map(|e| e.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                let opened_for = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                format!(
                    "Circuit breaker '{}' is open for {} seconds; retry in {} seconds",
                    self.name,
                    opened_for.as_secs(),
                    remaining.as_secs().max(1)
                )
            }
            CircuitState::HalfOpen => format!(
                "Circuit breaker '{}' is half-open, testing recovery ({}/{} trial successes)",
                self.name, inner.counts.consecutive_successes, self.half_open_max_requests
            ),
        }
    }

    fn before_call(&self) -> Result<u64, Rejection> {
        let now = Instant::now();
        let (outcome, transitions) = {
            let mut inner = self.inner.lock();
            let mut transitions = Vec::new();
            self.current_state(&mut inner, now, &mut transitions);

            let outcome = match inner.state {
                CircuitState::Open => {
                    tracing::trace!(breaker = %self.name, "Circuit open, rejecting call");
                    Err(Rejection::Open)
                }
                CircuitState::HalfOpen if inner.counts.requests >= self.half_open_max_requests => {
                    tracing::trace!(breaker = %self.name, "Half-open trial slots exhausted");
                    Err(Rejection::TooManyTrials)
                }
                CircuitState::Closed | CircuitState::HalfOpen => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (outcome, transitions)
        };
        self.notify(&transitions);
        outcome
    }

    fn after_call(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let transitions = {
            let mut inner = self.inner.lock();
            let mut transitions = Vec::new();
            self.current_state(&mut inner, now, &mut transitions);

            if inner.generation != generation {
                tracing::trace!(breaker = %self.name, "Outcome from a previous generation ignored");
            } else if success {
                self.on_success(&mut inner, now, &mut transitions);
            } else {
                self.on_failure(&mut inner, now, &mut transitions);
            }
            transitions
        };
        self.notify(&transitions);
    }

    fn on_success(&self, inner: &mut Inner, now: Instant, transitions: &mut Vec<Transition>) {
        inner.counts.on_success();
        if inner.state == CircuitState::HalfOpen {
            debug!(
                breaker = %self.name,
                successes = inner.counts.consecutive_successes,
                threshold = self.half_open_max_requests,
                "Trial call succeeded"
            );
            if inner.counts.consecutive_successes >= self.half_open_max_requests {
                self.transition_to(inner, CircuitState::Closed, now, transitions);
            }
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant, transitions: &mut Vec<Transition>) {
        inner.counts.on_failure();
        match inner.state {
            CircuitState::Closed => {
                if self.ready_to_trip(&inner.counts) {
                    self.transition_to(inner, CircuitState::Open, now, transitions);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(inner, CircuitState::Open, now, transitions);
            }
            CircuitState::Open => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.minimum_requests && counts.failure_ratio() >= self.failure_ratio
    }

    /// Apply the time-based moves: window rollover while closed, cooldown
    /// expiry while open.
    fn current_state(&self, inner: &mut Inner, now: Instant, transitions: &mut Vec<Transition>) {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    debug!(breaker = %self.name, "Open duration elapsed, transitioning to half-open");
                    self.transition_to(inner, CircuitState::HalfOpen, now, transitions);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn transition_to(
        &self,
        inner: &mut Inner,
        new_state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        let counts = inner.counts;

        inner.state = new_state;
        if new_state == CircuitState::Open {
            inner.opened_at = Some(now);
        }
        self.new_generation(inner, now);

        match new_state {
            CircuitState::Closed => {
                info!(event = "circuit_state_change", breaker = %self.name, from = %old_state, to = %new_state, "Circuit breaker closed");
            }
            CircuitState::Open => {
                warn!(
                    event = "circuit_state_change",
                    breaker = %self.name,
                    from = %old_state,
                    to = %new_state,
                    requests = counts.requests,
                    failures = counts.total_failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                debug!(event = "circuit_state_change", breaker = %self.name, from = %old_state, to = %new_state, "Circuit breaker half-open");
            }
        }
        telemetry_metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => new_state.to_string()
        )
        .increment(1);

        transitions.push(Transition {
            from: old_state,
            to: new_state,
        });
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => window_end(now, self.interval),
            CircuitState::Open => Some(now + self.open_duration),
            CircuitState::HalfOpen => None,
        };
    }

    fn notify(&self, transitions: &[Transition]) {
        if let Some(hook) = &self.on_state_change {
            for t in transitions {
                hook(&self.name, t.from, t.to);
            }
        }
    }
}

fn window_end(now: Instant, interval: Duration) -> Option<Instant> {
    (!interval.is_zero()).then(|| now + interval)
}

enum Rejection {
    Open,
    TooManyTrials,
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// Records the outcome of an admitted call, as a failure if it never settles.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_call(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(min_requests: u32, ratio: f64, open: Duration, trials: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            name: "test".to_string(),
            failure_ratio: ratio,
            minimum_requests: min_requests,
            interval: Duration::ZERO,
            open_duration: open,
            half_open_max_requests: trials,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn stays_closed_below_minimum_volume() {
        let cb = CircuitBreaker::new(&config(5, 0.5, Duration::from_secs(30), 1));
        for _ in 0..4 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().total_failures, 4);
    }

    #[tokio::test]
    async fn opens_at_ratio_and_rejects_without_invoking() {
        let cb = CircuitBreaker::new(&config(4, 0.5, Duration::from_secs(30), 1));
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await; // 2 of 4
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(result.unwrap_err().is_rejection());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_limits_trials() {
        let cb = Arc::new(CircuitBreaker::new(&config(1, 1.0, Duration::from_millis(10), 1)));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.call(|| async {
                    let _ = wait.await;
                    Ok::<(), &'static str>(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(
            succeed(&cb).await,
            Err(BreakerError::TooManyTrials { .. })
        ));

        release.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn trial_failure_reopens() {
        let cb = CircuitBreaker::new(&config(1, 1.0, Duration::from_millis(10), 2));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn stale_generation_outcome_is_ignored() {
        let cb = Arc::new(CircuitBreaker::new(&config(1, 0.5, Duration::from_secs(30), 1)));
        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.call(|| async {
                    let _ = wait.await;
                    Ok::<(), &'static str>(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();
        // Success from the closed generation must not touch the open one
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[tokio::test]
    async fn window_rollover_clears_counts() {
        let mut cfg = config(3, 0.5, Duration::from_secs(30), 1);
        cfg.interval = Duration::from_millis(20);
        let cb = CircuitBreaker::new(&cfg);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().requests, 1);
    }

    #[tokio::test]
    async fn dropped_call_counts_as_failure() {
        let cb = CircuitBreaker::new(&config(1, 1.0, Duration::from_secs(30), 1));
        let pending = cb.call(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn hook_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::<(CircuitState, CircuitState)>::new()));
        let hook: StateChangeHook = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_: &str, from: CircuitState, to: CircuitState| {
                seen.lock().push((from, to));
            })
        };
        let cb = CircuitBreaker::new(&config(1, 1.0, Duration::from_millis(10), 1))
            .with_state_change_hook(hook);

        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        succeed(&cb).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn disabled_breaker_passes_everything() {
        let mut cfg = config(1, 0.1, Duration::from_secs(30), 1);
        cfg.enabled = false;
        let cb = CircuitBreaker::new(&cfg);
        for _ in 0..10 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.status_message().contains("disabled"));
    }
}
