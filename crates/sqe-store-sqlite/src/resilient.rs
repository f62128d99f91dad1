// crates/sqe-store-sqlite/src/resilient.rs
// ============================================================================
// Module: Resilient Execution Layer
// Description: Bounded randomized retry and circuit breaking for database
//              round trips.
// Purpose: Absorb transient contention (busy/locked) without masking real
//          application errors, and shed load from an unhealthy database.
// Dependencies: rusqlite, rand, serde, thiserror, tokio
// ============================================================================

//! ## Overview
//! Every database round trip in this crate runs through a [`RetryExecutor`].
//! Transient contention errors (the SQLite busy/locked analogues of deadlock
//! victim and lock-wait timeout) are retried up to a fixed bound with an
//! escalating, partially randomized delay; non-transient errors fail on the
//! first attempt. A process-wide [`CircuitBreaker`] counts consecutive
//! transient failures across calls and, once open, fails fast with a
//! distinct error without invoking the operation at all. The breaker resets
//! on any success.
//!
//! The executor is transparent to its callers: they reason about logical
//! success or failure, never about individual attempts.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rusqlite::ErrorCode;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default total retry budget per logical operation.
const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base delay for the escalating backoff schedule (ms).
const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default upper bound for randomized jitter added to each delay (ms).
const DEFAULT_MAX_JITTER_MS: u64 = 50;
/// Default consecutive-failure threshold before the breaker opens.
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;

// ============================================================================
// SECTION: Transient Classification
// ============================================================================

/// Marks which error values represent transient server-side conditions that
/// are worth retrying.
pub trait TransientError {
    /// Returns `true` when retrying the operation may succeed.
    fn is_transient(&self) -> bool;
}

/// Classified database communication error.
///
/// # Invariants
/// - `Busy` and `Locked` are the only transient classifications.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum CommError {
    /// Another connection holds a conflicting lock (retryable).
    #[error("database busy: {0}")]
    Busy(String),
    /// A table is locked by a conflicting operation (retryable).
    #[error("database locked: {0}")]
    Locked(String),
    /// Unique or primary-key constraint violation (not retryable).
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),
    /// Any other non-transient database error.
    #[error("database error: {0}")]
    Other(String),
}

impl TransientError for CommError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Locked(_))
    }
}

impl From<rusqlite::Error> for CommError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(inner, _) = &error {
            match inner.code {
                ErrorCode::DatabaseBusy => return Self::Busy(error.to_string()),
                ErrorCode::DatabaseLocked => return Self::Locked(error.to_string()),
                ErrorCode::ConstraintViolation
                    if matches!(
                        inner.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                            | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    ) =>
                {
                    return Self::UniqueViolation(error.to_string());
                }
                _ => {}
            }
        }
        Self::Other(error.to_string())
    }
}

// ============================================================================
// SECTION: Retry Config
// ============================================================================

/// Retry policy configuration.
///
/// # Invariants
/// - `base_delay_ms` must be greater than zero.
/// - The delay before retry *n* (1-based) is `base_delay_ms * (n-1)!` plus
///   up to `max_jitter_ms` of randomized jitter.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// Total retry budget per logical operation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for the escalating backoff schedule (ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for randomized jitter added to each delay (ms).
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Consecutive-failure threshold before the breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_jitter_ms: DEFAULT_MAX_JITTER_MS,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
        }
    }
}

impl RetryConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message when a field is out of range.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than zero".to_string());
        }
        if self.breaker_threshold == 0 {
            return Err("breaker_threshold must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Returns the default retry budget.
const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Returns the default backoff base delay.
const fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

/// Returns the default jitter bound.
const fn default_max_jitter_ms() -> u64 {
    DEFAULT_MAX_JITTER_MS
}

/// Returns the default breaker threshold.
const fn default_breaker_threshold() -> u32 {
    DEFAULT_BREAKER_THRESHOLD
}

/// Saturating factorial used by the backoff schedule.
const fn factorial(n: u32) -> u64 {
    let bound = n as u64;
    let mut result: u64 = 1;
    let mut step: u64 = 1;
    while step <= bound {
        result = result.saturating_mul(step);
        step += 1;
    }
    result
}

// ============================================================================
// SECTION: Circuit Breaker
// ============================================================================

/// Process-wide breaker state shared across all callers of one policy
/// instance.
///
/// # Invariants
/// - Opens after `threshold` consecutive transient failures; any success
///   fully resets the count.
/// - Non-transient failures never count toward engagement.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive-failure threshold.
    threshold: u32,
    /// Consecutive transient failures since the last success.
    consecutive_failures: AtomicU32,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given threshold.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Returns `true` when the breaker is open (failing fast).
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold
    }

    /// Returns the current consecutive-failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Records one countable underlying failure.
    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful call, closing the breaker.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Explicitly resets the breaker to the closed state.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// SECTION: Cancellation
// ============================================================================

/// Caller-held flag aborting an in-flight retry loop early.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    /// Shared cancellation state.
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the retry loop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns `true` when cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Outcome classification of a retried operation.
#[derive(Debug, ThisError)]
pub enum RetryError<E: Error> {
    /// The operation's own error, surfaced after the first non-transient
    /// failure or after the retry budget is exhausted.
    #[error(transparent)]
    Inner(E),
    /// The breaker is open; the operation was not invoked.
    #[error("circuit open after {consecutive_failures} consecutive failures")]
    CircuitOpen {
        /// Failure count at the time of the fast-fail.
        consecutive_failures: u32,
    },
    /// The caller cancelled the retry loop.
    #[error("retry loop cancelled")]
    Cancelled,
}

// ============================================================================
// SECTION: Stats
// ============================================================================

/// Internal retry counters.
#[derive(Debug, Default)]
struct RetryStats {
    /// Underlying operation invocations.
    attempts: AtomicU64,
    /// Retries performed after transient failures.
    retries: AtomicU64,
    /// Calls rejected immediately because the breaker was open.
    fast_fails: AtomicU64,
}

/// Snapshot of retry-layer counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStatsSnapshot {
    /// Underlying operation invocations.
    pub attempts: u64,
    /// Retries performed after transient failures.
    pub retries: u64,
    /// Calls rejected immediately because the breaker was open.
    pub fast_fails: u64,
}

// ============================================================================
// SECTION: Executor
// ============================================================================

/// One retry policy instance, usable from sync and async call sites.
///
/// # Invariants
/// - The breaker is shared state for every caller of this instance; one
///   caller's sustained failures fail fast for all of them.
#[derive(Debug)]
pub struct RetryExecutor {
    /// Policy configuration.
    config: RetryConfig,
    /// Shared breaker state.
    breaker: Arc<CircuitBreaker>,
    /// Attempt counters.
    stats: RetryStats,
}

impl RetryExecutor {
    /// Creates an executor with a fresh breaker.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_threshold));
        Self::with_breaker(config, breaker)
    }

    /// Creates an executor sharing an existing breaker.
    #[must_use]
    pub const fn with_breaker(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            stats: RetryStats {
                attempts: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                fast_fails: AtomicU64::new(0),
            },
        }
    }

    /// Returns the shared breaker state.
    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Returns a snapshot of the attempt counters.
    #[must_use]
    pub fn stats(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            fast_fails: self.stats.fast_fails.load(Ordering::Relaxed),
        }
    }

    /// Executes an operation with bounded randomized retry.
    ///
    /// Blocks the calling thread between attempts; use the async shape from
    /// task contexts.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Inner`] on the first non-transient failure or
    /// once the retry budget is exhausted.
    pub fn execute_retry<T, E, F>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Error + TransientError,
        F: FnMut() -> Result<T, E>,
    {
        let mut retry = 1u32;
        loop {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && retry <= self.config.max_retries => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(self.backoff_delay(retry));
                    retry += 1;
                }
                Err(error) => return Err(RetryError::Inner(error)),
            }
        }
    }

    /// Executes an operation with retry and the shared circuit breaker.
    ///
    /// Each underlying transient failure counts toward breaker engagement;
    /// once the threshold is reached the loop (and every later call) fails
    /// fast without invoking the operation. Any success closes the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::CircuitOpen`] when the breaker is open, or
    /// [`RetryError::Inner`] as for [`Self::execute_retry`].
    pub fn execute_retry_with_breaker<T, E, F>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Error + TransientError,
        F: FnMut() -> Result<T, E>,
    {
        let mut retry = 1u32;
        loop {
            if self.breaker.is_open() {
                self.stats.fast_fails.fetch_add(1, Ordering::Relaxed);
                return Err(RetryError::CircuitOpen {
                    consecutive_failures: self.breaker.consecutive_failures(),
                });
            }
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match op() {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) if error.is_transient() => {
                    self.breaker.record_failure();
                    if retry > self.config.max_retries {
                        return Err(RetryError::Inner(error));
                    }
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(self.backoff_delay(retry));
                    retry += 1;
                }
                Err(error) => return Err(RetryError::Inner(error)),
            }
        }
    }

    /// Async shape of [`Self::execute_retry`], honoring a cancel flag.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Cancelled`] when the flag is set, otherwise as
    /// for the sync shape.
    pub async fn execute_retry_async<T, E, F, Fut>(
        &self,
        mut op: F,
        cancel: &CancelFlag,
    ) -> Result<T, RetryError<E>>
    where
        E: Error + TransientError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && retry <= self.config.max_retries => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.backoff_delay(retry)).await;
                    retry += 1;
                }
                Err(error) => return Err(RetryError::Inner(error)),
            }
        }
    }

    /// Async shape of [`Self::execute_retry_with_breaker`], honoring a
    /// cancel flag.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Cancelled`] when the flag is set,
    /// [`RetryError::CircuitOpen`] when the breaker is open, otherwise as for
    /// the sync shape.
    pub async fn execute_retry_with_breaker_async<T, E, F, Fut>(
        &self,
        mut op: F,
        cancel: &CancelFlag,
    ) -> Result<T, RetryError<E>>
    where
        E: Error + TransientError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            if self.breaker.is_open() {
                self.stats.fast_fails.fetch_add(1, Ordering::Relaxed);
                return Err(RetryError::CircuitOpen {
                    consecutive_failures: self.breaker.consecutive_failures(),
                });
            }
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) if error.is_transient() => {
                    self.breaker.record_failure();
                    if retry > self.config.max_retries {
                        return Err(RetryError::Inner(error));
                    }
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.backoff_delay(retry)).await;
                    retry += 1;
                }
                Err(error) => return Err(RetryError::Inner(error)),
            }
        }
    }

    /// Computes the delay before the given (1-based) retry.
    fn backoff_delay(&self, retry: u32) -> Duration {
        let escalated = self.config.base_delay_ms.saturating_mul(factorial(retry - 1));
        let jitter = if self.config.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
        };
        Duration::from_millis(escalated.saturating_add(jitter))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
