//! Per-domain politeness delay.
//!
//! The transport calls [`Throttle::wait`] before every attempt. Requests to the same
//! domain (scheme + host + port) are spaced at least `delay` (+ jitter) apart; different
//! domains never wait on each other.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use trawl_core::throttle::{Throttle, ThrottleConfig};
//!
//! let throttle = Throttle::new(
//!     ThrottleConfig::new(Duration::from_secs(1)).with_jitter(Duration::from_millis(500)),
//! );
//! # let _ = throttle;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::util::random_below;

/// Configuration for the per-domain throttle.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests to the same domain.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Create a new config with the given per-domain delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Effective spacing for one request (delay + random jitter).
    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        self.delay + Duration::from_millis(random_below(self.jitter.as_millis() as u64))
    }
}

impl Default for ThrottleConfig {
    /// 1 second delay, 500ms jitter.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Shared per-domain schedule. Cloning shares the same schedule.
#[derive(Clone)]
pub struct Throttle {
    config: ThrottleConfig,
    /// Earliest start time handed out per domain key.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Extract the domain key from a URL (scheme://host:port).
    fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    /// Wait for this domain's next slot.
    ///
    /// The slot is reserved under the lock, so concurrent callers for one domain queue up
    /// behind each other instead of waking together.
    pub async fn wait(&self, url: &str) {
        let Some(domain) = Self::domain_key(url) else {
            return;
        };

        let start = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots.get(&domain).copied().filter(|s| *s > now).unwrap_or(now);
            slots.insert(domain.clone(), start + self.config.effective_delay());
            start
        };

        let sleep_for = start.saturating_duration_since(Instant::now());
        if !sleep_for.is_zero() {
            tracing::debug!(
                domain = %domain,
                sleep_ms = %sleep_for.as_millis(),
                "Throttling request"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }
}
