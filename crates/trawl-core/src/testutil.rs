//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in tests. All mocks share state through
//! `Arc`, so a clone handed to the engine can be inspected afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{
    BatchReport, ErrorKind, FetchResult, Page, ParseOutput, ParsedRecord, RecordFailure,
};
use crate::proxy::ProxyAddress;
use crate::reporter::{EngineEvent, EngineReporter};
use crate::traits::{Fetcher, Parser, StorageSink};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// One scripted fetch outcome.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Status {
        status: u16,
        body: String,
        headers: Vec<(String, String)>,
    },
    Error(ErrorKind),
}

impl MockResponse {
    pub fn ok(body: &str) -> Self {
        Self::Status {
            status: 200,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Status {
            status,
            body: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self::Error(kind)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Self::Status { headers, .. } = &mut self {
            headers.push((name.to_lowercase(), value.to_string()));
        }
        self
    }
}

/// A recorded fetch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub url: String,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockSession {
    pub proxy: Option<String>,
}

struct FetcherState {
    scripts: HashMap<String, VecDeque<MockResponse>>,
    default: MockResponse,
    latency: Duration,
    calls: Vec<MockCall>,
    per_proxy: HashMap<String, (usize, usize)>,
}

/// Fetcher that serves scripted responses per URL and records concurrency gauges.
///
/// URLs without a script (or whose script ran out) get the default response.
#[derive(Clone)]
pub struct MockFetcher {
    state: Arc<Mutex<FetcherState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    sessions_opened: Arc<AtomicUsize>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FetcherState {
                scripts: HashMap::new(),
                default: MockResponse::ok("<html><body>default</body></html>"),
                latency: Duration::ZERO,
                calls: Vec::new(),
                per_proxy: HashMap::new(),
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            sessions_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn script(self, url: &str, responses: impl IntoIterator<Item = MockResponse>) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(url.to_string())
            .or_default()
            .extend(responses);
        self
    }

    pub fn with_default(self, response: MockResponse) -> Self {
        self.state.lock().unwrap().default = response;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().unwrap().latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Peak concurrent fetches seen through each proxy.
    pub fn max_in_flight_per_proxy(&self) -> HashMap<String, usize> {
        self.state
            .lock()
            .unwrap()
            .per_proxy
            .iter()
            .map(|(proxy, (_, max))| (proxy.clone(), *max))
            .collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }
}

/// Decrements the gauges even if the fetch future is dropped mid-flight.
struct InFlightGuard {
    fetcher: MockFetcher,
    proxy: Option<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.fetcher.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(proxy) = &self.proxy {
            let mut state = self.fetcher.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((current, _)) = state.per_proxy.get_mut(proxy) {
                *current = current.saturating_sub(1);
            }
        }
    }
}

impl Fetcher for MockFetcher {
    type Session = MockSession;

    fn open_session(&self, proxy: Option<&ProxyAddress>) -> Result<MockSession, AppError> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            proxy: proxy.map(ToString::to_string),
        })
    }

    async fn fetch(&self, session: &MockSession, url: &str) -> FetchResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (response, latency) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(MockCall {
                url: url.to_string(),
                proxy: session.proxy.clone(),
            });
            if let Some(proxy) = &session.proxy {
                let entry = state.per_proxy.entry(proxy.clone()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 = entry.1.max(entry.0);
            }
            let scripted = state.scripts.get_mut(url).and_then(VecDeque::pop_front);
            (scripted.unwrap_or_else(|| state.default.clone()), state.latency)
        };
        let _guard = InFlightGuard {
            fetcher: self.clone(),
            proxy: session.proxy.clone(),
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match response {
            MockResponse::Status {
                status,
                body,
                headers,
            } => FetchResult::from_status(url, status, body, headers.into_iter().collect()),
            MockResponse::Error(kind) => FetchResult::from_error(url, kind, format!("mock {kind}")),
        }
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Parser yielding one record per page (`url`, `title`) unless configured otherwise.
#[derive(Clone, Default)]
pub struct MockParser {
    links: Arc<Mutex<HashMap<String, Vec<String>>>>,
    fail_on: Arc<Mutex<HashSet<String>>>,
    fixed_records: Arc<Mutex<Vec<serde_json::Map<String, serde_json::Value>>>>,
    pub parsed: Arc<Mutex<Vec<String>>>,
}

impl MockParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links returned as discovered URLs for `url`.
    pub fn with_links(self, url: &str, links: &[&str]) -> Self {
        self.links.lock().unwrap().insert(
            url.to_string(),
            links.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    pub fn failing_on(self, url: &str) -> Self {
        self.fail_on.lock().unwrap().insert(url.to_string());
        self
    }

    /// Every page yields exactly this record.
    pub fn with_record(self, fields: serde_json::Value) -> Self {
        self.with_records([fields])
    }

    /// Every page yields exactly these records, in order.
    pub fn with_records<I>(self, records: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        *self.fixed_records.lock().unwrap() = records
            .into_iter()
            .filter_map(|fields| match fields {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self
    }
}

impl Parser for MockParser {
    fn parse(&self, page: &Page<'_>) -> Result<ParseOutput, AppError> {
        self.parsed.lock().unwrap().push(page.url.to_string());
        if self.fail_on.lock().unwrap().contains(page.url) {
            return Err(AppError::ParseError(format!("cannot parse {}", page.url)));
        }

        let fixed = self.fixed_records.lock().unwrap().clone();
        let records = if fixed.is_empty() {
            vec![
                ParsedRecord::new(page.url)
                    .with_field("url", page.url)
                    .with_field("title", format!("Title of {}", page.url)),
            ]
        } else {
            fixed
                .into_iter()
                .map(|fields| ParsedRecord {
                    fields,
                    ..ParsedRecord::new(page.url)
                })
                .collect()
        };
        let discovered = self
            .links
            .lock()
            .unwrap()
            .get(page.url)
            .cloned()
            .unwrap_or_default();
        Ok(ParseOutput::new(records, discovered))
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Sink that keeps records in memory.
#[derive(Clone, Default)]
pub struct MockSink {
    pub records: Arc<Mutex<Vec<ParsedRecord>>>,
    /// Size of every write call, in order.
    pub batches: Arc<Mutex<Vec<usize>>>,
    pub flushes: Arc<AtomicUsize>,
    fail_with: Arc<Mutex<Option<String>>>,
    required_field: Arc<Mutex<Option<String>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails as a whole.
    pub fn failing(reason: &str) -> Self {
        let sink = Self::default();
        *sink.fail_with.lock().unwrap() = Some(reason.to_string());
        sink
    }

    /// Records lacking `field` are rejected individually.
    pub fn requiring_field(field: &str) -> Self {
        let sink = Self::default();
        *sink.required_field.lock().unwrap() = Some(field.to_string());
        sink
    }

    pub fn stored(&self) -> Vec<ParsedRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl StorageSink for MockSink {
    async fn write(&self, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
        if let Some(reason) = self.fail_with.lock().unwrap().clone() {
            return Err(AppError::StorageError(reason));
        }
        self.batches.lock().unwrap().push(records.len());

        let required = self.required_field.lock().unwrap().clone();
        let mut report = BatchReport::default();
        let mut stored = self.records.lock().unwrap();
        for (index, record) in records.iter().enumerate() {
            match &required {
                Some(field) if record.get(field).is_none() => report.failed.push(RecordFailure {
                    index,
                    reason: format!("missing field '{field}'"),
                }),
                _ => {
                    stored.push(record.clone());
                    report.written += 1;
                }
            }
        }
        Ok(report)
    }

    async fn flush(&self) -> Result<(), AppError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Engine reporter that records event labels.
#[derive(Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == label)
            .count()
    }
}

impl EngineReporter for RecordingReporter {
    fn report(&self, event: EngineEvent<'_>) {
        let label = match &event {
            EngineEvent::JobStarted { .. } => "JobStarted",
            EngineEvent::ItemSucceeded { .. } => "ItemSucceeded",
            EngineEvent::ItemRetrying { .. } => "ItemRetrying",
            EngineEvent::ItemFailed { .. } => "ItemFailed",
            EngineEvent::ProxyBackpressure { .. } => "ProxyBackpressure",
            EngineEvent::BatchStored { .. } => "BatchStored",
            EngineEvent::CircuitOpened { .. } => "CircuitOpened",
            EngineEvent::JobFinished { .. } => "JobFinished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
