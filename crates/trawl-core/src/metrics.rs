use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::models::FetchResult;
use crate::util::host_of;

/// Job counters exposed to metrics backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Fetch attempts that reached the fetcher.
    Fetched,
    Succeeded,
    Failed,
    Retried,
    Discovered,
    RecordsStored,
    ProxyExhausted,
}

impl Counter {
    const ALL: [Counter; 7] = [
        Counter::Fetched,
        Counter::Succeeded,
        Counter::Failed,
        Counter::Retried,
        Counter::Discovered,
        Counter::RecordsStored,
        Counter::ProxyExhausted,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::Fetched => "fetched",
            Counter::Succeeded => "succeeded",
            Counter::Failed => "failed",
            Counter::Retried => "retried",
            Counter::Discovered => "discovered",
            Counter::RecordsStored => "records_stored",
            Counter::ProxyExhausted => "proxy_exhausted",
        }
    }
}

/// Receives counter increments and fetch results from the engine.
pub trait MetricsCollector: Send + Sync {
    fn incr(&self, counter: Counter, by: u64);

    /// One finished fetch attempt.
    fn record_fetch(&self, _result: &FetchResult) {}
}

/// Request totals for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    /// Failed attempts by error kind.
    pub errors: BTreeMap<String, u64>,
}

impl DomainStats {
    pub fn avg_latency_ms(&self) -> u64 {
        self.total_latency_ms
            .checked_div(self.requests)
            .unwrap_or_default()
    }

    fn record(&mut self, result: &FetchResult) {
        self.requests += 1;
        self.total_latency_ms += result.elapsed.as_millis() as u64;
        if result.is_success() {
            self.successes += 1;
        } else {
            self.failures += 1;
            let kind = result.error_kind.map_or("unknown", |k| k.as_str());
            *self.errors.entry(kind.to_string()).or_default() += 1;
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn incr(&self, _counter: Counter, _by: u64) {}
}

/// In-memory counters and per-host fetch stats.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: [AtomicU64; Counter::ALL.len()],
    domains: Mutex<BTreeMap<String, DomainStats>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    fn lock_domains(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DomainStats>> {
        self.domains.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned metrics mutex");
            poisoned.into_inner()
        })
    }

    pub fn domain(&self, host: &str) -> Option<DomainStats> {
        self.lock_domains().get(host).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetched: self.get(Counter::Fetched),
            succeeded: self.get(Counter::Succeeded),
            failed: self.get(Counter::Failed),
            retried: self.get(Counter::Retried),
            discovered: self.get(Counter::Discovered),
            records_stored: self.get(Counter::RecordsStored),
            proxy_exhausted: self.get(Counter::ProxyExhausted),
            domains: self.lock_domains().clone(),
        }
    }
}

impl MetricsCollector for AtomicMetrics {
    fn incr(&self, counter: Counter, by: u64) {
        self.counters[counter.index()].fetch_add(by, Ordering::Relaxed);
    }

    fn record_fetch(&self, result: &FetchResult) {
        let host = host_of(&result.url).unwrap_or_else(|| "-".to_string());
        self.lock_domains().entry(host).or_default().record(result);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub fetched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub discovered: u64,
    pub records_stored: u64,
    pub proxy_exhausted: u64,
    pub domains: BTreeMap<String, DomainStats>,
}
