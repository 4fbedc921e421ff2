//! Retry policy with exponential backoff.
//!
//! Retry behaviour is plain data: the transport consults a [`RetryPolicy`] after every
//! attempt and gets back a [`RetryDecision`]. The delay schedule is
//! `base * multiplier^(attempt-1)` plus uniform jitter, capped at `max_backoff`, and never
//! shorter than the previous delay for the same item or the server's `Retry-After`.

use std::collections::HashSet;
use std::time::Duration;

use crate::models::{ErrorKind, FetchOutcome, FetchResult};
use crate::util::random_below;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `delay` has elapsed.
    RetryAfter(Duration),
    /// Terminal: the item is done (succeeded, permanent failure, or attempts exhausted).
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub multiplier: f64,
    /// Ceiling for any single delay.
    pub max_backoff: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter: Duration,
    /// Failure kinds treated as transient.
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            retryable: default_retryable(),
        }
    }
}

/// Timeout, connection reset, 5xx, 429 and proxy failures.
pub fn default_retryable() -> HashSet<ErrorKind> {
    HashSet::from([
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::ServerError,
        ErrorKind::RateLimited,
        ErrorKind::Proxy,
    ])
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_backoff(mut self, base: Duration, multiplier: f64) -> Self {
        self.base_backoff = base;
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Final success / transient / permanent classification of an attempt.
    pub fn classify(&self, result: &FetchResult) -> FetchOutcome {
        match result.error_kind {
            _ if result.outcome == FetchOutcome::Success => FetchOutcome::Success,
            Some(kind) if self.retryable.contains(&kind) => FetchOutcome::TransientFailure,
            _ => FetchOutcome::PermanentFailure,
        }
    }

    /// Deterministic part of the delay before retry number `attempt` (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the next attempt, given the attempts made so far and the previous delay.
    pub fn next_delay(
        &self,
        attempts: u32,
        previous: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let jitter = Duration::from_millis(random_below(self.jitter.as_millis() as u64));
        let mut delay = self.backoff_for_attempt(attempts) + jitter;
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        delay.max(previous).min(self.max_backoff)
    }

    /// Decide what follows an attempt. `attempts` counts the attempt just made.
    pub fn decide(&self, attempts: u32, previous: Duration, result: &FetchResult) -> RetryDecision {
        if result.outcome != FetchOutcome::TransientFailure || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.next_delay(attempts, previous, result.retry_after))
    }
}
