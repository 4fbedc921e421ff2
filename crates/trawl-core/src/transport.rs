//! Retrying, proxy-rotating HTTP transport.
//!
//! Wraps any single-attempt [`Fetcher`] with:
//! - proxy selection from a shared [`ProxyPool`] (leases released on every path),
//! - a bounded [`SessionPool`] of reusable client sessions,
//! - an optional per-domain [`Throttle`],
//! - retry classification and backoff from a [`RetryPolicy`].
//!
//! The engine drives one [`attempt`](HttpTransport::attempt) at a time and schedules
//! retries itself; [`fetch`](HttpTransport::fetch) runs the whole retry loop inline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::models::{ErrorKind, FetchOutcome, FetchResult, WorkItem};
use crate::proxy::{ProxyLease, ProxyPool, RotationStrategy};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::SessionPool;
use crate::throttle::Throttle;
use crate::traits::Fetcher;
use crate::util::normalize_url;

/// One finished attempt and what the retry policy says to do next.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub result: FetchResult,
    pub decision: RetryDecision,
}

#[derive(Clone)]
pub struct HttpTransport<F: Fetcher> {
    fetcher: F,
    proxies: ProxyPool,
    sessions: Arc<SessionPool<F::Session>>,
    retry: RetryPolicy,
    strategy: RotationStrategy,
    throttle: Option<Throttle>,
    /// How long [`fetch`](Self::fetch) waits for a proxy before giving up.
    max_proxy_wait: Duration,
}

impl<F: Fetcher> HttpTransport<F> {
    pub fn new(fetcher: F, proxies: ProxyPool, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            proxies,
            sessions: Arc::new(SessionPool::new(4)),
            retry,
            strategy: RotationStrategy::default(),
            throttle: None,
            max_proxy_wait: Duration::from_secs(60),
        }
    }

    pub fn with_rotation(mut self, strategy: RotationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_sessions(mut self, sessions_count: usize) -> Self {
        self.sessions = Arc::new(SessionPool::new(sessions_count));
        self
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_max_proxy_wait(mut self, wait: Duration) -> Self {
        self.max_proxy_wait = wait;
        self
    }

    /// Make one attempt for `item`. `item.attempts` counts attempts already made.
    ///
    /// Fails with `ProxyExhaustedError` (no attempt made) when proxies are configured but
    /// none is eligible, or with `HttpError` when a session cannot be opened.
    pub async fn attempt(&self, item: &WorkItem) -> Result<Attempt, AppError> {
        let lease = if self.proxies.is_empty() {
            None
        } else {
            Some(self.proxies.select(self.strategy)?)
        };
        let proxy = lease.as_ref().map(ProxyLease::address);

        let session = self
            .sessions
            .checkout(proxy, |p| self.fetcher.open_session(p))?;

        if let Some(throttle) = &self.throttle {
            throttle.wait(&item.url).await;
        }

        let attempt_no = item.attempts + 1;
        tracing::debug!(
            url = %item.url,
            attempt = attempt_no,
            proxy = %proxy.map(ToString::to_string).unwrap_or_default(),
            "Fetching"
        );

        let started = Instant::now();
        let mut result = self.fetcher.fetch(session.session(), &item.url).await;
        drop(session);

        if result.elapsed.is_zero() {
            result.elapsed = started.elapsed();
        }
        result.proxy = proxy.map(ToString::to_string);
        result.outcome = self.retry.classify(&result);

        if let Some(lease) = &lease {
            if blames_proxy(&result) {
                self.proxies.mark_failure(lease);
            } else {
                self.proxies.mark_success(lease);
            }
        }

        let decision = self.retry.decide(attempt_no, item.last_backoff, &result);
        if result.outcome != FetchOutcome::Success {
            tracing::debug!(
                url = %item.url,
                attempt = attempt_no,
                status = result.status,
                error = %result.failure_reason(),
                ?decision,
                "Attempt failed"
            );
        }
        Ok(Attempt { result, decision })
    }

    /// Fetch `url` with the full retry contract, waiting out backoffs inline.
    ///
    /// Returns the last attempt's result. `Err` only for invalid URLs, session setup
    /// failures, or proxies staying unavailable longer than the proxy wait budget.
    pub async fn fetch(&self, url: &str) -> Result<FetchResult, AppError> {
        let key = normalize_url(url)?;
        let mut item = WorkItem::new(url, key, 0);
        let mut exhausted_since: Option<Instant> = None;

        loop {
            match self.attempt(&item).await {
                Err(AppError::ProxyExhaustedError { retry_after }) => {
                    let since = *exhausted_since.get_or_insert_with(Instant::now);
                    if since.elapsed() + retry_after > self.max_proxy_wait {
                        return Err(AppError::ProxyExhaustedError { retry_after });
                    }
                    tracing::debug!(url = %url, wait_ms = retry_after.as_millis() as u64, "Waiting for a proxy");
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => return Err(e),
                Ok(Attempt { result, decision }) => {
                    exhausted_since = None;
                    item.attempts += 1;
                    match decision {
                        RetryDecision::GiveUp => return Ok(result),
                        RetryDecision::RetryAfter(delay) => {
                            tracing::info!(
                                url = %url,
                                attempt = item.attempts,
                                delay_ms = delay.as_millis() as u64,
                                reason = %result.failure_reason(),
                                "Retrying"
                            );
                            item.last_backoff = delay;
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }
}

/// Whether a failed attempt counts against the proxy that carried it.
///
/// Network-level failures, rate limiting and proxy auth / forbidden responses do;
/// other HTTP statuses are the target's answer and count as a working proxy.
fn blames_proxy(result: &FetchResult) -> bool {
    if result.outcome == FetchOutcome::Success {
        return false;
    }
    matches!(
        result.error_kind,
        Some(ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Proxy | ErrorKind::RateLimited)
    ) || matches!(result.status, Some(403 | 407))
}
