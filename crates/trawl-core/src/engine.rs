//! The fetch → parse → store pipeline.
//!
//! A [`ScrapeEngine`] runs one [`ScrapeJob`] at a time:
//!
//! 1. seeds go into a [`RequestScheduler`] (dedup, depth limit),
//! 2. `concurrency` workers make single attempts through the [`HttpTransport`],
//! 3. successful pages go to the job's [`Parser`]; records flow to one storage writer
//!    task, discovered links back into the scheduler,
//! 4. transient failures are re-queued after their backoff, permanent ones recorded,
//! 5. systemic failures (circuit breaker, storage, proxy starvation) abort the job.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::AppError;
use crate::job::{FailedUrl, JobFailure, JobStatus, JobSummary, ScrapeJob};
use crate::metrics::{Counter, MetricsCollector, NoopMetrics};
use crate::models::{FetchResult, ItemState, Page, ParseOutput, ParsedRecord, WorkItem};
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::registry::ParserRegistry;
use crate::reporter::{EngineEvent, EngineReporter, TracingReporter};
use crate::retry::RetryDecision;
use crate::scheduler::{Disposition, RequestScheduler, SubmitOutcome};
use crate::throttle::Throttle;
use crate::traits::{Fetcher, Parser, StorageSink};
use crate::transport::{Attempt, HttpTransport};
use crate::util::resolve_url;

pub struct ScrapeEngine<F: Fetcher, S: StorageSink> {
    fetcher: F,
    proxies: ProxyPool,
    registry: Arc<ParserRegistry>,
    sink: S,
    metrics: Arc<dyn MetricsCollector>,
    reporter: Arc<dyn EngineReporter>,
}

impl<F: Fetcher, S: StorageSink> ScrapeEngine<F, S> {
    pub fn new(fetcher: F, proxies: ProxyPool, registry: Arc<ParserRegistry>, sink: S) -> Self {
        Self {
            fetcher,
            proxies,
            registry,
            sink,
            metrics: Arc::new(NoopMetrics),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn EngineReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run `job` to completion, abort, or cancellation.
    ///
    /// Per-item failures are listed in the summary. Setup errors and systemic failures
    /// return `Err(JobFailure)` carrying the summary of what was done.
    pub async fn run(
        &self,
        job: ScrapeJob,
        cancel: CancellationToken,
    ) -> Result<JobSummary, JobFailure> {
        let mut summary = JobSummary::new(&job);

        let parser = match job
            .validate()
            .and_then(|()| self.registry.build(&job.parser_id, &job.parser_settings))
        {
            Ok(parser) => parser,
            Err(error) => {
                summary.finish(JobStatus::Aborted);
                return Err(JobFailure {
                    error,
                    summary: Box::new(summary),
                });
            }
        };

        let span = tracing::info_span!("job", job_id = %job.id, parser = %job.parser_id);
        self.execute(job, parser, cancel, summary)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        job: ScrapeJob,
        parser: Arc<dyn Parser>,
        cancel: CancellationToken,
        mut summary: JobSummary,
    ) -> Result<JobSummary, JobFailure> {
        let scheduler = Arc::new(RequestScheduler::new(job.max_depth));
        let tally = Arc::new(Mutex::new(Tally::default()));

        for seed in &job.seeds {
            match scheduler.submit(seed, 0, None) {
                SubmitOutcome::Accepted => {}
                SubmitOutcome::Duplicate => lock(&tally).duplicate_urls += 1,
                SubmitOutcome::InvalidUrl(reason) => {
                    self.reporter.report(EngineEvent::ItemFailed {
                        url: seed,
                        attempts: 0,
                        reason: &reason,
                    });
                    self.metrics.incr(Counter::Failed, 1);
                    lock(&tally).failures.push(FailedUrl {
                        url: seed.clone(),
                        reason,
                        attempts: 0,
                    });
                }
                other => tracing::warn!(url = %seed, outcome = ?other, "Seed not queued"),
            }
        }

        summary.status = JobStatus::Running;
        self.reporter.report(EngineEvent::JobStarted {
            job_id: job.id,
            parser_id: &job.parser_id,
            seeds: job.seeds.len(),
            concurrency: job.concurrency,
        });

        let control = Arc::new(JobControl::new(Arc::clone(&scheduler)));
        let (records_tx, records_rx) = mpsc::channel(job.concurrency.saturating_mul(2).max(1));
        let writer = StorageWriter {
            sink: self.sink.clone(),
            batch_size: job.batch_size,
            primary_keys: job.primary_keys.clone(),
            required_fields: job.required_fields.clone(),
            control: Arc::clone(&control),
            metrics: Arc::clone(&self.metrics),
            reporter: Arc::clone(&self.reporter),
        };
        let writer = tokio::spawn(writer.run(records_rx).in_current_span());

        let mut transport = HttpTransport::new(
            self.fetcher.clone(),
            self.proxies.clone(),
            job.retry.clone(),
        )
        .with_rotation(job.proxy.strategy)
        .with_sessions(job.session.sessions_count)
        .with_max_proxy_wait(job.proxy.max_proxy_wait);
        if let Some(throttle) = job.throttle.clone() {
            transport = transport.with_throttle(Throttle::new(throttle));
        }

        let breaker = CircuitBreaker::new(format!("job-{}", job.id), job.breaker_threshold);
        let worker = Arc::new(Worker {
            transport,
            parser,
            scheduler: Arc::clone(&scheduler),
            breaker: breaker.clone(),
            records: records_tx,
            control: Arc::clone(&control),
            metrics: Arc::clone(&self.metrics),
            reporter: Arc::clone(&self.reporter),
            tally: Arc::clone(&tally),
            max_proxy_wait: job.proxy.max_proxy_wait,
            exhausted_since: Mutex::new(None),
        });

        let report = scheduler
            .run(
                job.concurrency,
                cancel.clone(),
                job.cancel_grace,
                move |item| {
                    let worker = Arc::clone(&worker);
                    async move { worker.process(item).await }
                },
            )
            .await;

        // Every record sender is gone once the workers are; the writer drains and flushes.
        let storage = match writer.await {
            Ok(outcome) => outcome,
            Err(e) => {
                control.fail(AppError::StorageError(format!(
                    "storage writer task failed: {e}"
                )));
                StorageOutcome::default()
            }
        };

        let tally = std::mem::take(&mut *lock(&tally));
        summary.succeeded = report.stats.succeeded;
        summary.permanently_failed = tally.failures.len();
        summary.cancelled = report.cancelled.len();
        summary.attempts = tally.attempts;
        summary.retried = tally.retried;
        summary.discovered = tally.discovered;
        summary.duplicate_urls = tally.duplicate_urls;
        summary.failures = tally.failures;
        summary.records_stored = storage.stored;
        summary.records_rejected = storage.rejected;
        summary.records_duplicate = storage.duplicates;
        summary.records_invalid = storage.invalid;
        summary.proxies = self.proxies.stats().iter().map(ProxyEndpoint::report).collect();
        summary.circuit_breaker = Some(breaker.stats());

        let error = control.take_error();
        let status = if error.is_some() {
            JobStatus::Aborted
        } else if cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        summary.finish(status);

        self.reporter.report(EngineEvent::JobFinished {
            job_id: summary.job_id,
            status,
            succeeded: summary.succeeded,
            failed: summary.permanently_failed,
            cancelled: summary.cancelled,
        });

        match error {
            Some(error) => Err(JobFailure {
                error,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned engine mutex");
        poisoned.into_inner()
    })
}

#[derive(Default)]
struct Tally {
    attempts: u64,
    retried: u64,
    discovered: usize,
    duplicate_urls: usize,
    failures: Vec<FailedUrl>,
}

/// First systemic error wins; recording it aborts the scheduler.
struct JobControl {
    scheduler: Arc<RequestScheduler>,
    error: Mutex<Option<AppError>>,
}

impl JobControl {
    fn new(scheduler: Arc<RequestScheduler>) -> Self {
        Self {
            scheduler,
            error: Mutex::new(None),
        }
    }

    fn fail(&self, error: AppError) {
        {
            let mut slot = lock(&self.error);
            if slot.is_some() {
                return;
            }
            tracing::error!(error = %error, "Aborting job");
            *slot = Some(error);
        }
        self.scheduler.abort();
    }

    fn has_failed(&self) -> bool {
        lock(&self.error).is_some()
    }

    fn take_error(&self) -> Option<AppError> {
        lock(&self.error).take()
    }
}

/// Per-item pipeline shared by all scheduler workers.
struct Worker<F: Fetcher> {
    transport: HttpTransport<F>,
    parser: Arc<dyn Parser>,
    scheduler: Arc<RequestScheduler>,
    breaker: CircuitBreaker,
    records: mpsc::Sender<Vec<ParsedRecord>>,
    control: Arc<JobControl>,
    metrics: Arc<dyn MetricsCollector>,
    reporter: Arc<dyn EngineReporter>,
    tally: Arc<Mutex<Tally>>,
    max_proxy_wait: Duration,
    /// Start of the current stretch with no eligible proxy.
    exhausted_since: Mutex<Option<Instant>>,
}

impl<F: Fetcher> Worker<F> {
    async fn process(&self, mut item: WorkItem) -> Disposition {
        let Attempt { result, decision } = match self.transport.attempt(&item).await {
            Ok(attempt) => attempt,
            Err(AppError::ProxyExhaustedError { retry_after }) => {
                return self.proxy_backpressure(item, retry_after);
            }
            Err(e) => {
                let reason = e.to_string();
                if e.should_trip_circuit() {
                    self.record_fetch_failure(&reason);
                }
                return self.fail(item, reason);
            }
        };

        *lock(&self.exhausted_since) = None;
        item.attempts += 1;
        lock(&self.tally).attempts += 1;
        self.metrics.incr(Counter::Fetched, 1);
        self.metrics.record_fetch(&result);

        if result.is_success() {
            self.breaker.record_success();
            return self.handle_page(item, &result).await;
        }

        let reason = result.failure_reason();
        self.record_fetch_failure(&reason);

        match decision {
            RetryDecision::RetryAfter(delay) => {
                item.last_backoff = delay;
                lock(&self.tally).retried += 1;
                self.metrics.incr(Counter::Retried, 1);
                self.reporter.report(EngineEvent::ItemRetrying {
                    url: &item.url,
                    attempt: item.attempts,
                    delay,
                    reason: &reason,
                });
                Disposition::Retry(item, delay)
            }
            RetryDecision::GiveUp => self.fail(item, reason),
        }
    }

    async fn handle_page(&self, mut item: WorkItem, result: &FetchResult) -> Disposition {
        let page = Page {
            url: &result.final_url,
            status: result.status.unwrap_or(200),
            headers: &result.headers,
            body: &result.body,
        };
        let ParseOutput {
            records,
            discovered,
        } = match self.parser.parse(&page) {
            Ok(output) => output,
            Err(e) => return self.fail(item, e.to_string()),
        };

        let record_count = records.len();
        if !records.is_empty() && self.records.send(records).await.is_err() {
            tracing::warn!(url = %item.url, "Storage writer gone, dropping records");
        }

        let mut accepted = 0;
        for link in &discovered {
            let resolved = match resolve_url(&result.final_url, link) {
                Ok(url) => url,
                Err(e) => {
                    tracing::debug!(url = %item.url, link = %link, error = %e, "Skipping link");
                    continue;
                }
            };
            match self.scheduler.submit(&resolved, item.depth + 1, Some(&item.url)) {
                SubmitOutcome::Accepted => accepted += 1,
                SubmitOutcome::Duplicate => lock(&self.tally).duplicate_urls += 1,
                SubmitOutcome::TooDeep | SubmitOutcome::Closed => {}
                SubmitOutcome::InvalidUrl(reason) => {
                    tracing::debug!(url = %item.url, link = %resolved, %reason, "Skipping link");
                }
            }
        }
        if accepted > 0 {
            lock(&self.tally).discovered += accepted;
            self.metrics.incr(Counter::Discovered, accepted as u64);
        }

        item.state = ItemState::Succeeded;
        self.metrics.incr(Counter::Succeeded, 1);
        self.reporter.report(EngineEvent::ItemSucceeded {
            url: &item.url,
            attempts: item.attempts,
            records: record_count,
            discovered: accepted,
        });
        Disposition::Done(item)
    }

    /// No proxy right now: pause dispatch and put the item back without spending an
    /// attempt, or abort once the wait budget is used up.
    fn proxy_backpressure(&self, item: WorkItem, retry_after: Duration) -> Disposition {
        self.metrics.incr(Counter::ProxyExhausted, 1);
        let waited = lock(&self.exhausted_since)
            .get_or_insert_with(Instant::now)
            .elapsed();

        let remaining = self.max_proxy_wait.saturating_sub(waited);
        if remaining.is_zero() {
            self.control.fail(AppError::ProxyExhaustedError { retry_after });
        } else {
            let pause = retry_after.min(remaining).max(Duration::from_millis(1));
            self.reporter
                .report(EngineEvent::ProxyBackpressure { retry_after: pause });
            self.scheduler.pause_for(pause);
        }
        Disposition::Requeue(item)
    }

    fn record_fetch_failure(&self, reason: &str) {
        if let Err(tripped) = self.breaker.record_failure(reason) {
            if let AppError::CircuitBreakerTripped {
                consecutive_failures,
            } = &tripped
            {
                self.reporter.report(EngineEvent::CircuitOpened {
                    consecutive_failures: *consecutive_failures,
                });
            }
            self.control.fail(tripped);
        }
    }

    fn fail(&self, mut item: WorkItem, reason: String) -> Disposition {
        item.state = ItemState::PermanentlyFailed;
        self.metrics.incr(Counter::Failed, 1);
        self.reporter.report(EngineEvent::ItemFailed {
            url: &item.url,
            attempts: item.attempts,
            reason: &reason,
        });
        lock(&self.tally).failures.push(FailedUrl {
            url: item.url.clone(),
            reason,
            attempts: item.attempts,
        });
        Disposition::Done(item)
    }
}

#[derive(Debug, Default)]
struct StorageOutcome {
    stored: usize,
    rejected: usize,
    duplicates: usize,
    invalid: usize,
}

/// The only caller of the sink: dedups, batches and writes records.
struct StorageWriter<S: StorageSink> {
    sink: S,
    batch_size: usize,
    primary_keys: Vec<String>,
    required_fields: Vec<String>,
    control: Arc<JobControl>,
    metrics: Arc<dyn MetricsCollector>,
    reporter: Arc<dyn EngineReporter>,
}

impl<S: StorageSink> StorageWriter<S> {
    async fn run(self, mut rx: mpsc::Receiver<Vec<ParsedRecord>>) -> StorageOutcome {
        let mut outcome = StorageOutcome::default();
        let mut fingerprints = HashSet::new();
        let mut buffer: Vec<ParsedRecord> = Vec::with_capacity(self.batch_size);
        let mut failed = false;

        while let Some(records) = rx.recv().await {
            // Keep draining after a failure so workers never block on send.
            if failed {
                continue;
            }
            for record in records {
                if let Some(field) = record.missing_field(&self.required_fields) {
                    tracing::debug!(url = %record.source_url, field, "Dropping record missing a required field");
                    outcome.invalid += 1;
                    continue;
                }
                if fingerprints.insert(record.fingerprint(&self.primary_keys)) {
                    buffer.push(record);
                } else {
                    outcome.duplicates += 1;
                }
            }
            while buffer.len() >= self.batch_size {
                let batch: Vec<_> = buffer.drain(..self.batch_size).collect();
                if let Err(e) = self.write_batch(&batch, &mut outcome).await {
                    self.control.fail(e);
                    failed = true;
                    buffer.clear();
                    break;
                }
            }
        }

        if failed {
            return outcome;
        }
        if !buffer.is_empty()
            && let Err(e) = self.write_batch(&buffer, &mut outcome).await
        {
            self.control.fail(e);
            return outcome;
        }
        if let Err(e) = self.sink.flush().await {
            self.control.fail(as_storage_error(e));
        }
        if outcome.duplicates > 0 {
            tracing::info!(duplicates = outcome.duplicates, "Dropped duplicate records");
        }
        if outcome.invalid > 0 {
            tracing::info!(invalid = outcome.invalid, "Dropped records missing required fields");
        }
        outcome
    }

    async fn write_batch(
        &self,
        batch: &[ParsedRecord],
        outcome: &mut StorageOutcome,
    ) -> Result<(), AppError> {
        if self.control.has_failed() {
            tracing::debug!(records = batch.len(), "Writing batch after job abort");
        }
        let report = self.sink.write(batch).await.map_err(as_storage_error)?;

        for failure in &report.failed {
            tracing::warn!(
                url = batch.get(failure.index).map(|r| r.source_url.as_str()).unwrap_or_default(),
                reason = %failure.reason,
                "Record rejected by sink"
            );
        }
        outcome.stored += report.written;
        outcome.rejected += report.failed.len();
        self.metrics
            .incr(Counter::RecordsStored, report.written as u64);
        self.reporter.report(EngineEvent::BatchStored {
            written: report.written,
            rejected: report.failed.len(),
        });
        Ok(())
    }
}

fn as_storage_error(error: AppError) -> AppError {
    match error {
        AppError::StorageError(_) => error,
        other => AppError::StorageError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::metrics::AtomicMetrics;
    use crate::models::ErrorKind;
    use crate::proxy::ProxyPoolConfig;
    use crate::retry::RetryPolicy;
    use crate::testutil::{MockFetcher, MockParser, MockResponse, MockSink, RecordingReporter};

    fn registry(parser: MockParser) -> Arc<ParserRegistry> {
        let mut registry = ParserRegistry::new();
        registry
            .register("mock", "Test parser", &[], move |_| {
                Ok(Arc::new(parser.clone()) as Arc<dyn Parser>)
            })
            .unwrap();
        Arc::new(registry)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_backoff(Duration::from_millis(5), 2.0)
            .with_max_backoff(Duration::from_millis(50))
            .with_jitter(Duration::ZERO)
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://shop.test/p/{i}")).collect()
    }

    fn engine(fetcher: &MockFetcher, parser: MockParser, sink: &MockSink) -> ScrapeEngine<MockFetcher, MockSink> {
        ScrapeEngine::new(fetcher.clone(), ProxyPool::empty(), registry(parser), sink.clone())
    }

    #[tokio::test]
    async fn test_all_seeds_succeed_within_concurrency() {
        let fetcher = MockFetcher::new().with_latency(Duration::from_millis(20));
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", urls(5))
            .with_concurrency(2)
            .with_retry(fast_retry(3));

        let summary = engine(&fetcher, MockParser::new(), &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.permanently_failed, 0);
        assert_eq!(summary.records_stored, 5);
        assert_eq!(fetcher.max_in_flight(), 2);
        assert_eq!(sink.stored().len(), 5);
        assert_eq!(sink.flushes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_to_success() {
        let url = "https://shop.test/flaky";
        let fetcher = MockFetcher::new().script(
            url,
            [
                MockResponse::status(500),
                MockResponse::status(500),
                MockResponse::ok("<html>ok</html>"),
            ],
        );
        let sink = MockSink::new();
        let reporter = Arc::new(RecordingReporter::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let job = ScrapeJob::new("mock", [url])
            .with_concurrency(1)
            .with_retry(fast_retry(3));

        let summary = engine(&fetcher, MockParser::new(), &sink)
            .with_reporter(reporter.clone())
            .with_metrics(metrics.clone())
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.retried, 2);
        assert_eq!(fetcher.calls_for(url), 3);
        assert_eq!(reporter.count("ItemRetrying"), 2);

        let domain = metrics.domain("shop.test").unwrap();
        assert_eq!(domain.requests, 3);
        assert_eq!(domain.successes, 1);
        assert_eq!(domain.errors["server_error"], 2);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let url = "https://shop.test/down";
        let fetcher = MockFetcher::new().with_default(MockResponse::status(503));
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", [url])
            .with_concurrency(1)
            .with_retry(fast_retry(4));

        let summary = engine(&fetcher, MockParser::new(), &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.calls_for(url), 4);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(summary.failures[0].attempts, 4);
        assert!(summary.failures[0].reason.contains("503"));
    }

    #[tokio::test]
    async fn test_not_found_fails_after_one_attempt() {
        let url = "https://shop.test/missing";
        let fetcher = MockFetcher::new().script(url, [MockResponse::status(404)]);
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", [url]).with_retry(fast_retry(5));

        let summary = engine(&fetcher, MockParser::new(), &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(summary.failures[0].url, url);
        assert_eq!(summary.failures[0].attempts, 1);
        assert!(summary.failures[0].reason.contains("404"));
        assert_eq!(fetcher.calls_for(url), 1);
    }

    #[tokio::test]
    async fn test_proxy_cooldown_pauses_then_resumes() {
        let url = "https://shop.test/via-proxy";
        let pool = ProxyPool::from_lines(
            ["proxy.test:3128"],
            ProxyPoolConfig {
                ema_alpha: 0.6,
                min_samples: 1,
                failure_threshold: 0.5,
                cooldown: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap();
        let fetcher = MockFetcher::new().script(
            url,
            [MockResponse::error(ErrorKind::Proxy), MockResponse::ok("ok")],
        );
        let sink = MockSink::new();
        let metrics = Arc::new(AtomicMetrics::new());
        let job = ScrapeJob::new("mock", [url])
            .with_concurrency(1)
            .with_retry(fast_retry(3));

        let started = Instant::now();
        let summary = ScrapeEngine::new(fetcher.clone(), pool.clone(), registry(MockParser::new()), sink)
            .with_metrics(metrics.clone())
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.attempts, 2, "waiting for a proxy must not spend attempts");
        assert!(metrics.get(Counter::ProxyExhausted) >= 1);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.stats()[0].cooldowns, 1);
        assert_eq!(pool.stats()[0].in_use, 0);
        assert_eq!(summary.proxies.len(), 1);
        assert_eq!(summary.proxies[0].proxy, "http://proxy.test:3128");
        assert_eq!(summary.proxies[0].cooldowns, 1);
        assert_eq!(summary.proxies[0].successes, 1);
    }

    #[tokio::test]
    async fn test_proxy_starvation_aborts_after_wait_budget() {
        let pool = ProxyPool::from_lines(
            ["proxy.test:3128"],
            ProxyPoolConfig {
                ema_alpha: 0.9,
                min_samples: 1,
                cooldown: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .unwrap();
        let fetcher = MockFetcher::new().with_default(MockResponse::error(ErrorKind::Connection));
        let job = ScrapeJob::new("mock", urls(3))
            .with_concurrency(1)
            .with_retry(fast_retry(3))
            .with_proxy_policy(crate::job::ProxyPolicy {
                max_proxy_wait: Duration::from_millis(50),
                ..Default::default()
            });

        let started = Instant::now();
        let failure = ScrapeEngine::new(fetcher.clone(), pool, registry(MockParser::new()), MockSink::new())
            .run(job, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AppError::ProxyExhaustedError { .. }));
        assert_eq!(failure.summary.status, JobStatus::Aborted);
        assert_eq!(failure.summary.cancelled, 3);
        assert_eq!(fetcher.total_calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_proxy_cap_is_respected() {
        let pool = ProxyPool::from_lines(
            ["p1.test:8080", "p2.test:8080"],
            ProxyPoolConfig {
                max_concurrent_per_proxy: 2,
                busy_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .unwrap();
        let fetcher = MockFetcher::new().with_latency(Duration::from_millis(20));
        let job = ScrapeJob::new("mock", urls(12)).with_concurrency(6);

        let summary = ScrapeEngine::new(fetcher.clone(), pool, registry(MockParser::new()), MockSink::new())
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 12);
        let peaks = fetcher.max_in_flight_per_proxy();
        assert_eq!(peaks.len(), 2);
        assert!(peaks.values().all(|peak| *peak <= 2), "peaks: {peaks:?}");
        assert!(fetcher.max_in_flight() <= 4);
    }

    #[tokio::test]
    async fn test_circuit_breaker_aborts_and_cancels_queue() {
        let fetcher = MockFetcher::new().with_default(MockResponse::status(404));
        let reporter = Arc::new(RecordingReporter::new());
        let job = ScrapeJob::new("mock", urls(10))
            .with_concurrency(1)
            .with_retry(fast_retry(1))
            .with_breaker_threshold(5);

        let failure = engine(&fetcher, MockParser::new(), &MockSink::new())
            .with_reporter(reporter.clone())
            .run(job, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            AppError::CircuitBreakerTripped {
                consecutive_failures: 5
            }
        ));
        assert_eq!(failure.summary.status, JobStatus::Aborted);
        assert_eq!(failure.summary.permanently_failed, 5);
        assert_eq!(failure.summary.cancelled, 5);
        assert_eq!(fetcher.total_calls(), 5);
        assert_eq!(reporter.count("CircuitOpened"), 1);
        let breaker = failure.summary.circuit_breaker.as_ref().unwrap();
        assert_eq!(breaker.state, crate::circuit_breaker::CircuitState::Open);
        assert_eq!(breaker.consecutive_failures, 5);
    }

    #[tokio::test]
    async fn test_discovered_links_follow_depth_and_dedup() {
        let root = "https://shop.test/";
        let parser = MockParser::new()
            .with_links(root, &["/a", "b", "/a#reviews", "mailto:x@y.test"])
            .with_links("https://shop.test/a", &["/c", "/"]);
        let fetcher = MockFetcher::new();
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", [root]).with_max_depth(1);

        let summary = engine(&fetcher, parser.clone(), &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.discovered, 2);
        assert_eq!(fetcher.calls_for("https://shop.test/c"), 0, "depth 2 is too deep");
        assert_eq!(fetcher.calls_for("https://shop.test/a"), 1);
        assert_eq!(fetcher.calls_for("https://shop.test/b"), 1);
        assert_eq!(fetcher.calls_for(root), 1, "root is never re-enqueued");
    }

    #[tokio::test]
    async fn test_failed_url_is_not_refetched_when_rediscovered() {
        let missing = "https://shop.test/missing";
        let root = "https://shop.test/";
        let fetcher = MockFetcher::new().script(missing, [MockResponse::status(404)]);
        let parser = MockParser::new().with_links(root, &["/missing"]);
        let job = ScrapeJob::new("mock", [missing, root])
            .with_concurrency(1)
            .with_max_depth(1)
            .with_retry(fast_retry(3));

        let summary = engine(&fetcher, parser, &MockSink::new())
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.discovered, 0);
        assert_eq!(summary.duplicate_urls, 1);
        assert_eq!(fetcher.calls_for(missing), 1);
    }

    #[tokio::test]
    async fn test_parse_error_fails_item_without_refetch() {
        let url = "https://shop.test/broken";
        let fetcher = MockFetcher::new();
        let job = ScrapeJob::new("mock", [url]).with_retry(fast_retry(3));

        let summary = engine(&fetcher, MockParser::new().failing_on(url), &MockSink::new())
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.permanently_failed, 1);
        assert!(summary.failures[0].reason.starts_with("Parse error"));
        assert_eq!(fetcher.calls_for(url), 1);
    }

    #[tokio::test]
    async fn test_duplicate_records_are_dropped() {
        let parser = MockParser::new().with_record(json!({"sku": "KN-1", "name": "Knife"}));
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", urls(3)).with_primary_keys(["sku"]);

        let summary = engine(&MockFetcher::new(), parser, &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_stored, 1);
        assert_eq!(summary.records_duplicate, 2);
        assert_eq!(sink.stored()[0].get("sku"), Some(&json!("KN-1")));
    }

    #[tokio::test]
    async fn test_records_without_url_from_one_page_are_all_stored() {
        let parser = MockParser::new().with_records([
            json!({"name": "Chef knife"}),
            json!({"name": "Paring knife"}),
        ]);
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", ["https://shop.test/knives"]);

        let summary = engine(&MockFetcher::new(), parser, &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_stored, 2);
        assert_eq!(summary.records_duplicate, 0);
        let names: Vec<_> = sink.stored().iter().map(|r| r.get("name").cloned()).collect();
        assert_eq!(names, vec![Some(json!("Chef knife")), Some(json!("Paring knife"))]);
    }

    #[tokio::test]
    async fn test_records_missing_required_fields_are_dropped() {
        let parser = MockParser::new().with_records([
            json!({"sku": "KN-1", "price": 45}),
            json!({"sku": "KN-2", "price": null}),
            json!({"sku": "", "price": 12}),
        ]);
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", ["https://shop.test/knives"])
            .with_primary_keys(["sku"])
            .with_required_fields(["sku", "price"]);

        let summary = engine(&MockFetcher::new(), parser, &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_stored, 1);
        assert_eq!(summary.records_invalid, 2);
        assert_eq!(sink.stored()[0].get("sku"), Some(&json!("KN-1")));
    }

    #[tokio::test]
    async fn test_records_are_written_in_batches() {
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", urls(5))
            .with_concurrency(1)
            .with_batch_size(2);

        engine(&MockFetcher::new(), MockParser::new(), &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*sink.batches.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_rejected_records_are_counted() {
        let parser = MockParser::new()
            .with_records([json!({"name": "no sku"}), json!({"name": "still no sku"})]);
        let sink = MockSink::requiring_field("sku");
        let job = ScrapeJob::new("mock", urls(1));

        let summary = engine(&MockFetcher::new(), parser, &sink)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_stored, 0);
        assert_eq!(summary.records_rejected, 2);
        assert_eq!(summary.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_job() {
        let job = ScrapeJob::new("mock", urls(4))
            .with_concurrency(1)
            .with_batch_size(1);

        let failure = engine(&MockFetcher::new(), MockParser::new(), &MockSink::failing("disk full"))
            .run(job, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AppError::StorageError(ref m) if m == "disk full"));
        assert_eq!(failure.summary.status, JobStatus::Aborted);
        assert_eq!(failure.summary.records_stored, 0);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_finish() {
        let fetcher = MockFetcher::new().with_latency(Duration::from_millis(150));
        let sink = MockSink::new();
        let job = ScrapeJob::new("mock", urls(3))
            .with_concurrency(1)
            .with_cancel_grace(Duration::from_secs(2));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = engine(&fetcher, MockParser::new(), &sink)
            .run(job, cancel)
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(fetcher.total_calls(), 1);
        assert_eq!(sink.stored().len(), 1, "records of finished items are still stored");
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_seeds() {
        let job = ScrapeJob::new(
            "mock",
            ["https://shop.test/x", "https://shop.test/x#top", "not a url"],
        );

        let summary = engine(&MockFetcher::new(), MockParser::new(), &MockSink::new())
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.duplicate_urls, 1);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(summary.failures[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_unknown_parser_fails_before_fetching() {
        let fetcher = MockFetcher::new();
        let job = ScrapeJob::new("missing", urls(1));

        let failure = engine(&fetcher, MockParser::new(), &MockSink::new())
            .run(job, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AppError::UnknownParser { .. }));
        assert_eq!(fetcher.total_calls(), 0);
    }
}
