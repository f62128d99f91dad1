// crates/sqe-store-sqlite/tests/retry_unit.rs
// ============================================================================
// Module: Retry Layer Unit Tests
// Description: Behavioral tests for bounded retry and the circuit breaker.
// Purpose: Validate invocation counts, the escalating backoff floor, breaker
//          engagement and reset, and async cancellation.
// ============================================================================

//! ## Overview
//! Unit-level tests for the resilience layer:
//! - Transient failures consume the retry budget; the invocation count and
//!   the cumulative backoff floor are observable
//! - Non-transient failures surface immediately without retry
//! - The breaker opens after its threshold of consecutive transient
//!   failures, fails fast without invoking, and closes on success
//! - The async shapes honor the cancel flag between attempts

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::time::Duration;
use std::time::Instant;

use sqe_store_sqlite::CancelFlag;
use sqe_store_sqlite::CommError;
use sqe_store_sqlite::RetryConfig;
use sqe_store_sqlite::RetryError;
use sqe_store_sqlite::RetryExecutor;

fn fast_config() -> RetryConfig {
    RetryConfig {
        max_retries: 10,
        base_delay_ms: 1,
        max_jitter_ms: 0,
        breaker_threshold: 5,
    }
}

#[test]
fn transient_failures_consume_budget_then_succeed() {
    let executor = RetryExecutor::new(RetryConfig::default());
    let mut calls = 0u32;
    let started = Instant::now();
    let result: Result<u32, RetryError<CommError>> = executor.execute_retry(|| {
        calls += 1;
        if calls <= 5 {
            Err(CommError::Busy("write lock held".to_string()))
        } else {
            Ok(calls)
        }
    });
    let elapsed = started.elapsed();
    assert_eq!(result.unwrap(), 6);
    assert_eq!(calls, 6);
    // Escalating schedule floor: 100 + 100 + 200 + 600 + 2400 ms.
    assert!(
        elapsed >= Duration::from_millis(2500),
        "cumulative backoff too short: {elapsed:?}"
    );
    let stats = executor.stats();
    assert_eq!(stats.attempts, 6);
    assert_eq!(stats.retries, 5);
}

#[test]
fn budget_exhaustion_surfaces_the_transient_error() {
    let executor = RetryExecutor::new(RetryConfig {
        max_retries: 2,
        base_delay_ms: 1,
        max_jitter_ms: 0,
        breaker_threshold: 5,
    });
    let mut calls = 0u32;
    let result: Result<(), RetryError<CommError>> = executor.execute_retry(|| {
        calls += 1;
        Err(CommError::Locked("table locked".to_string()))
    });
    assert!(matches!(
        result,
        Err(RetryError::Inner(CommError::Locked(_)))
    ));
    assert_eq!(calls, 3, "initial attempt plus two retries");
}

#[test]
fn non_transient_failure_is_not_retried() {
    let executor = RetryExecutor::new(fast_config());
    let mut calls = 0u32;
    let result: Result<(), RetryError<CommError>> = executor.execute_retry(|| {
        calls += 1;
        Err(CommError::Other("malformed statement".to_string()))
    });
    assert!(matches!(
        result,
        Err(RetryError::Inner(CommError::Other(_)))
    ));
    assert_eq!(calls, 1);
}

#[test]
fn breaker_opens_after_threshold_and_fails_fast() {
    let executor = RetryExecutor::new(fast_config());
    let mut calls = 0u32;
    let result: Result<(), RetryError<CommError>> = executor.execute_retry_with_breaker(|| {
        calls += 1;
        Err(CommError::Busy("saturated".to_string()))
    });
    assert!(matches!(
        result,
        Err(RetryError::CircuitOpen {
            consecutive_failures: 5
        })
    ));
    assert_eq!(calls, 5, "threshold bounds the underlying invocations");
    // Later calls fail fast without touching the operation.
    let mut later_calls = 0u32;
    let later: Result<(), RetryError<CommError>> = executor.execute_retry_with_breaker(|| {
        later_calls += 1;
        Ok(())
    });
    assert!(matches!(later, Err(RetryError::CircuitOpen { .. })));
    assert_eq!(later_calls, 0);
    assert_eq!(executor.stats().fast_fails, 2);
}

#[test]
fn non_transient_failures_never_engage_the_breaker() {
    let executor = RetryExecutor::new(fast_config());
    for _ in 0..10 {
        let result: Result<(), RetryError<CommError>> = executor
            .execute_retry_with_breaker(|| Err(CommError::Other("syntax".to_string())));
        assert!(matches!(result, Err(RetryError::Inner(CommError::Other(_)))));
    }
    assert!(!executor.breaker().is_open());
    assert_eq!(executor.stats().attempts, 10);
    assert_eq!(executor.stats().fast_fails, 0);
}

#[test]
fn success_closes_the_breaker() {
    let executor = RetryExecutor::new(fast_config());
    let mut calls = 0u32;
    let result: Result<u32, RetryError<CommError>> = executor.execute_retry_with_breaker(|| {
        calls += 1;
        if calls <= 4 {
            Err(CommError::Busy("warming up".to_string()))
        } else {
            Ok(calls)
        }
    });
    assert_eq!(result.unwrap(), 5);
    assert_eq!(executor.breaker().consecutive_failures(), 0);
    assert!(!executor.breaker().is_open());
}

#[tokio::test]
async fn async_shape_retries_then_succeeds() {
    let executor = RetryExecutor::new(fast_config());
    let cancel = CancelFlag::new();
    let mut calls = 0u32;
    let result: Result<u32, RetryError<CommError>> = executor
        .execute_retry_async(
            || {
                calls += 1;
                let outcome = if calls <= 2 {
                    Err(CommError::Busy("busy".to_string()))
                } else {
                    Ok(calls)
                };
                async move { outcome }
            },
            &cancel,
        )
        .await;
    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn cancellation_stops_the_loop_between_attempts() {
    let executor = RetryExecutor::new(fast_config());
    let cancel = CancelFlag::new();
    let mut calls = 0u32;
    let result: Result<(), RetryError<CommError>> = executor
        .execute_retry_with_breaker_async(
            || {
                calls += 1;
                if calls == 2 {
                    cancel.cancel();
                }
                async { Err(CommError::Busy("busy".to_string())) }
            },
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(RetryError::Cancelled)));
    assert_eq!(calls, 2, "flag is honored before the next attempt");
}

#[tokio::test]
async fn preset_cancellation_never_invokes() {
    let executor = RetryExecutor::new(fast_config());
    let cancel = CancelFlag::new();
    cancel.cancel();
    let mut calls = 0u32;
    let result: Result<(), RetryError<CommError>> = executor
        .execute_retry_async(
            || {
                calls += 1;
                async { Ok(()) }
            },
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(RetryError::Cancelled)));
    assert_eq!(calls, 0);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: RetryConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.base_delay_ms, 100);
    assert_eq!(config.max_jitter_ms, 50);
    assert_eq!(config.breaker_threshold, 5);
    config.validate().unwrap();
    let zero_base: RetryConfig = serde_json::from_str(r#"{"base_delay_ms": 0}"#).unwrap();
    assert!(zero_base.validate().is_err());
}
