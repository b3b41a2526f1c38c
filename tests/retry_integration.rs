//! Retry integration tests - executor against real backoff strategies

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use resilience_core::config::{BackoffConfig, BackoffKind, RetryConfig};
use resilience_core::failsafe::{
    BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff, RetryError,
    RetryExecutor, RetryPolicy, with_retry,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_fail_fail_succeed_invokes_three_times() {
    let strategy = ConstantBackoff::new(Duration::from_millis(5));
    let calls = AtomicU32::new(0);

    let result = RetryExecutor::new(3, &strategy)
        .execute(&CancellationToken::new(), || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("transient"),
                _ => Ok("payload"),
            }
        })
        .await;

    assert_eq!(result.unwrap(), "payload");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_always_failing_operation_is_invoked_n_plus_one_times() {
    let strategy = LinearBackoff::new(Duration::from_millis(1), Duration::from_millis(3));
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = RetryExecutor::new(4, &strategy)
        .execute(&CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("still down".to_string())
        })
        .await;

    match result {
        Err(RetryError::Exhausted { attempts, source }) => {
            assert_eq!(attempts, 5);
            assert_eq!(source, "still down");
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_cancel_during_backoff_sleep() {
    let strategy = ConstantBackoff::new(Duration::from_secs(30));
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let counted = Arc::clone(&calls);
    let result: Result<(), _> = RetryExecutor::new(3, &strategy)
        .execute(&token, || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err("down")
            }
        })
        .await;

    assert!(matches!(result, Err(RetryError::Cancelled { attempt: 0 })));
    assert!(result.is_err_and(|e| e.is_cancelled()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_policy_from_config() {
    let config = RetryConfig {
        max_attempts: 2,
        backoff: BackoffConfig {
            kind: BackoffKind::Constant,
            delay: Duration::from_millis(1),
            ..BackoffConfig::default()
        },
    };
    let policy = RetryPolicy::new(&config);
    assert_eq!(policy.strategy.next_delay(0), Duration::from_millis(1));
    assert_eq!(policy.strategy.next_delay(9), Duration::from_millis(1));

    let calls = AtomicU32::new(0);
    let result: Result<(), _> = with_retry(&policy, "store", &CancellationToken::new(), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("nope")
    })
    .await;

    assert_eq!(result.unwrap_err().into_inner(), Some("nope"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_exponential_schedule_is_monotone_and_capped() {
    let strategy = ExponentialBackoff::new(
        Duration::from_millis(100),
        Duration::from_secs(2),
        2.0,
        false,
    );

    let delays: Vec<Duration> = (0..10).map(|n| strategy.next_delay(n)).collect();
    assert_eq!(delays[0], Duration::from_millis(100));
    assert_eq!(delays[3], Duration::from_millis(800));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    assert_eq!(delays[9], Duration::from_secs(2));

    // Without jitter the schedule is a pure function of the attempt
    assert_eq!(strategy.next_delay(4), strategy.next_delay(4));
}

#[test]
fn test_jittered_delay_stays_within_half_to_one_and_a_half() {
    let strategy = ExponentialBackoff::new(
        Duration::from_millis(100),
        Duration::from_secs(1),
        2.0,
        true,
    );
    for attempt in 0..8 {
        let capped = strategy.capped_delay(attempt);
        let delay = strategy.next_delay(attempt);
        assert!(delay >= capped.mul_f64(0.5), "attempt {attempt}: {delay:?}");
        assert!(delay <= capped.mul_f64(1.5), "attempt {attempt}: {delay:?}");
    }
}
