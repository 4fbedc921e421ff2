use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::AppError;
use crate::proxy::{ProxyReport, RotationStrategy};
use crate::retry::RetryPolicy;
use crate::throttle::ThrottleConfig;

/// Status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    /// Stopped by a systemic failure (circuit breaker, storage, proxy exhaustion).
    Aborted,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Aborted => "aborted",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Aborted | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "aborted" => Ok(JobStatus::Aborted),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// How the transport uses the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    pub strategy: RotationStrategy,
    /// How long every proxy may stay unavailable before the job aborts.
    pub max_proxy_wait: Duration,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::RoundRobin,
            max_proxy_wait: Duration::from_secs(60),
        }
    }
}

/// Bounds on reusable client sessions.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub sessions_count: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self { sessions_count: 4 }
    }
}

/// A fully resolved job. The engine takes it by value, so it cannot change mid-run.
#[derive(Debug, Clone)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub parser_id: String,
    pub parser_settings: serde_json::Value,
    pub seeds: Vec<String>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub proxy: ProxyPolicy,
    pub session: SessionPolicy,
    /// Seeds are depth 0; discovered links at depth > `max_depth` are dropped.
    pub max_depth: u32,
    /// Consecutive fetch failures that abort the job. `0` disables the breaker.
    pub breaker_threshold: u32,
    /// How long in-flight items may run after cancellation.
    pub cancel_grace: Duration,
    pub batch_size: usize,
    /// Record fields whose values identify duplicates.
    pub primary_keys: Vec<String>,
    /// Fields a record must carry (non-null, non-empty) to be stored.
    pub required_fields: Vec<String>,
    /// Per-domain politeness delay, if any.
    pub throttle: Option<ThrottleConfig>,
}

impl ScrapeJob {
    pub fn new<I, S>(parser_id: impl Into<String>, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            parser_id: parser_id.into(),
            parser_settings: serde_json::Value::Object(serde_json::Map::new()),
            seeds: seeds.into_iter().map(Into::into).collect(),
            concurrency: 8,
            retry: RetryPolicy::default(),
            proxy: ProxyPolicy::default(),
            session: SessionPolicy::default(),
            max_depth: 0,
            breaker_threshold: 20,
            cancel_grace: Duration::from_secs(5),
            batch_size: 20,
            primary_keys: vec!["url".to_string()],
            required_fields: Vec::new(),
            throttle: None,
        }
    }

    pub fn with_parser_settings(mut self, settings: serde_json::Value) -> Self {
        self.parser_settings = settings;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_proxy_policy(mut self, proxy: ProxyPolicy) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_sessions(mut self, sessions_count: usize) -> Self {
        self.session.sessions_count = sessions_count;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker_threshold = threshold;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Checks the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.parser_id.trim().is_empty() {
            return Err(AppError::ConfigError("parser id must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(AppError::ConfigError("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(AppError::ConfigError("batch size must be at least 1".into()));
        }
        if self.primary_keys.is_empty() {
            return Err(AppError::ConfigError(
                "at least one primary key is required".into(),
            ));
        }
        if self.session.sessions_count == 0 {
            return Err(AppError::ConfigError(
                "sessions_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A URL that ended PermanentlyFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUrl {
    pub url: String,
    pub reason: String,
    pub attempts: u32,
}

/// What a job did, returned on success and embedded in [`JobFailure`].
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub parser_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub seeds: usize,
    pub succeeded: usize,
    pub permanently_failed: usize,
    pub cancelled: usize,
    /// Fetch attempts across all items.
    pub attempts: u64,
    /// Retries scheduled after transient failures.
    pub retried: u64,
    /// Discovered URLs accepted into the queue.
    pub discovered: usize,
    /// Submissions dropped because the URL was already seen.
    pub duplicate_urls: usize,
    pub records_stored: usize,
    pub records_rejected: usize,
    pub records_duplicate: usize,
    /// Records dropped for missing a required field.
    pub records_invalid: usize,
    pub failures: Vec<FailedUrl>,
    pub proxies: Vec<ProxyReport>,
    pub circuit_breaker: Option<CircuitBreakerStats>,
}

impl JobSummary {
    pub fn new(job: &ScrapeJob) -> Self {
        Self {
            job_id: job.id,
            parser_id: job.parser_id.clone(),
            status: JobStatus::Created,
            started_at: Utc::now(),
            finished_at: None,
            seeds: job.seeds.len(),
            succeeded: 0,
            permanently_failed: 0,
            cancelled: 0,
            attempts: 0,
            retried: 0,
            discovered: 0,
            duplicate_urls: 0,
            records_stored: 0,
            records_rejected: 0,
            records_duplicate: 0,
            records_invalid: 0,
            failures: Vec::new(),
            proxies: Vec::new(),
            circuit_breaker: None,
        }
    }

    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// A job stopped by a systemic error. Carries everything done before the stop.
#[derive(Debug, thiserror::Error)]
#[error("job {} {}: {error}", .summary.job_id, .summary.status)]
pub struct JobFailure {
    #[source]
    pub error: AppError,
    pub summary: Box<JobSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Aborted,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_job_builder() {
        let job = ScrapeJob::new("selector", ["https://a.test", "https://b.test"])
            .with_concurrency(2)
            .with_max_depth(1)
            .with_primary_keys(["url", "sku"]);

        assert_eq!(job.seeds.len(), 2);
        assert_eq!(job.concurrency, 2);
        assert_eq!(job.primary_keys, vec!["url", "sku"]);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let job = ScrapeJob::new("selector", ["https://a.test"]).with_concurrency(0);
        assert!(matches!(job.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_job_failure_display() {
        let job = ScrapeJob::new("shop", Vec::<String>::new());
        let mut summary = JobSummary::new(&job);
        summary.finish(JobStatus::Aborted);
        let failure = JobFailure {
            error: AppError::StorageError("disk full".into()),
            summary: Box::new(summary),
        };
        let text = failure.to_string();
        assert!(text.contains("aborted"));
        assert!(text.contains("disk full"));
    }
}
