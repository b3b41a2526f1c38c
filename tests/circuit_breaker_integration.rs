//! Circuit breaker integration tests - configuration and recovery

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use resilience_core::config::CircuitBreakerConfig;
use resilience_core::failsafe::{BreakerError, CircuitBreaker, CircuitState};

fn config(failure_ratio: f64, minimum_requests: u32, open_duration: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        name: "store".to_string(),
        failure_ratio,
        minimum_requests,
        interval: Duration::ZERO,
        open_duration,
        half_open_max_requests: 1,
    }
}

async fn fail(cb: &CircuitBreaker) {
    let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
}

async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
    cb.call(|| async { Ok(1) }).await
}

#[tokio::test]
async fn test_strict_config_opens_on_first_evaluated_window() {
    let cb = CircuitBreaker::new(&config(0.5, 2, Duration::from_secs(60)));

    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);

    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_lenient_config_tolerates_mixed_outcomes() {
    let cb = CircuitBreaker::new(&config(0.9, 10, Duration::from_secs(60)));

    for _ in 0..5 {
        fail(&cb).await;
        succeed(&cb).await.unwrap();
    }
    // 5 failures in 10 requests is below 0.9
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.counts().requests, 10);
    assert_eq!(cb.counts().total_failures, 5);
}

#[tokio::test]
async fn test_open_breaker_rejects_without_invoking() {
    let cb = CircuitBreaker::new(&config(1.0, 1, Duration::from_secs(60)));
    fail(&cb).await;

    let invoked = AtomicU32::new(0);
    let result = cb
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .await;

    assert!(matches!(result, Err(BreakerError::Open { ref name }) if name == "store"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recovers_through_half_open() {
    let cb = CircuitBreaker::new(&config(1.0, 1, Duration::from_millis(30)));
    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    assert_eq!(succeed(&cb).await.unwrap(), 1);
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.counts().requests, 0);
}

#[tokio::test]
async fn test_status_message_format() {
    let cb = CircuitBreaker::new(&config(1.0, 1, Duration::from_secs(30)));
    assert!(cb.status_message().contains("'store' is closed"));

    fail(&cb).await;
    let message = cb.status_message();
    assert!(message.contains("'store' is open"), "{message}");
    assert!(message.contains("retry in"), "{message}");
}

#[tokio::test]
async fn test_breakers_are_independent() {
    let a = Arc::new(CircuitBreaker::new(&config(1.0, 1, Duration::from_secs(60))));
    let b = Arc::new(CircuitBreaker::new(&config(1.0, 1, Duration::from_secs(60))));

    fail(&a).await;
    assert_eq!(a.state(), CircuitState::Open);
    assert_eq!(b.state(), CircuitState::Closed);
    assert!(succeed(&b).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_callers_share_state() {
    let cb = Arc::new(CircuitBreaker::new(&config(0.5, 10, Duration::from_secs(60))));

    let mut handles = Vec::new();
    for i in 0..20u32 {
        let cb = Arc::clone(&cb);
        handles.push(tokio::spawn(async move {
            let _ = cb
                .call(|| async move { if i % 4 == 0 { Ok(i) } else { Err("down") } })
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cb.state(), CircuitState::Open);
}
