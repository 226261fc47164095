//! Generic exponential-backoff retry and a circuit breaker, used by the
//! ledger adapter and wallet service to wrap fallible operations.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            base: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.base.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Runs `op` up to `config.max_attempts` times, sleeping between attempts
/// (never after the last one). Only retries errors for which
/// `AppError::is_retryable` is true; validation/state/etc. errors
/// short-circuit immediately.
pub async fn retry_with<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, max_attempts = config.max_attempts, "operation recovered");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(attempt, max_attempts = config.max_attempts, error = %err, "attempt failed");
                last_error = Some(err);
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.calculate_delay(attempt)).await;
                }
            }
        }
    }

    let err = last_error.expect("at least one attempt runs");
    error!(max_attempts = config.max_attempts, error = %err, "all attempts exhausted");
    Err(err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Fails fast once a dependency has been unhealthy for `failure_threshold`
/// consecutive calls, until `recovery_timeout` has elapsed, at which point a
/// single probe call is allowed through (half-open).
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: AtomicU32,
    last_failure_unix_secs: AtomicU64,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            failure_count: AtomicU32::new(0),
            last_failure_unix_secs: AtomicU64::new(0),
            state: Mutex::new(CircuitState::Closed),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock().unwrap()
    }

    /// Call before attempting the protected operation. Returns an error
    /// without invoking anything if the circuit is open and recovery hasn't
    /// elapsed yet.
    pub fn before_call(&self, now_unix_secs: u64) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if *state == CircuitState::Open {
            let last = self.last_failure_unix_secs.load(Ordering::Relaxed);
            if now_unix_secs.saturating_sub(last) >= self.recovery_timeout.as_secs() {
                *state = CircuitState::HalfOpen;
            } else {
                return Err(AppError::LedgerTransient(
                    "circuit breaker open, service unavailable".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock().unwrap();
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn on_failure(&self, now_unix_secs: u64) {
        self.last_failure_unix_secs.store(now_unix_secs, Ordering::Relaxed);
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            let mut state = self.state.lock().unwrap();
            *state = CircuitState::Open;
        }
    }
}
