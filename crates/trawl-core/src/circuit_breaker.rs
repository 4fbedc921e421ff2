//! Job-level circuit breaker over consecutive fetch failures.
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN (job aborts)
//!   ^  |
//!   +--+ success resets the count
//! ```
//!
//! There is no half-open state: once open, the breaker stays open for the rest of the job.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Fetches flow normally.
    Closed,
    /// Threshold reached; the job is being aborted.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Statistics about circuit breaker state for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Thread-safe consecutive-failure breaker shared by all workers of a job.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    /// `0` disables the breaker.
    threshold: u32,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32) -> Self {
        Self {
            name: name.into(),
            threshold,
            inner: Arc::new(Mutex::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_error: None,
            })),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock_inner();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
        }
    }

    /// A fetch succeeded: the failure streak is broken.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    /// A fetch failed. Returns `CircuitBreakerTripped` on the failure that opens the
    /// circuit; later failures return `Ok` so the trip is reported exactly once.
    pub fn record_failure(&self, reason: &str) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::Open {
            inner.last_error = Some(reason.to_string());
            return Ok(());
        }

        inner.consecutive_failures += 1;
        inner.last_error = Some(reason.to_string());

        if self.threshold > 0 && inner.consecutive_failures >= self.threshold {
            tracing::warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                error = %reason,
                "Circuit breaker opening after {} consecutive failures",
                inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            return Err(AppError::CircuitBreakerTripped {
                consecutive_failures: inner.consecutive_failures,
            });
        }
        Ok(())
    }
}
