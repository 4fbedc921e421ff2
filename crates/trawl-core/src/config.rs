use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::job::{ProxyPolicy, ScrapeJob, SessionPolicy};
use crate::models::ErrorKind;
use crate::proxy::{ProxyPool, ProxyPoolConfig, RotationStrategy};
use crate::retry::RetryPolicy;
use crate::throttle::ThrottleConfig;
use crate::util::read_list_file;

/// A job as written in a JSON job file. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub parser: String,
    pub parser_settings: serde_json::Value,
    pub urls: Vec<String>,
    /// One URL per line; blanks and `#` comments skipped.
    pub urls_file: Option<PathBuf>,
    pub concurrency: usize,
    pub max_depth: u32,
    /// `0` disables the breaker.
    pub circuit_breaker_threshold: u32,
    pub cancel_grace_ms: u64,
    pub retry: RetryConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub politeness: PolitenessConfig,
    pub request: RequestConfig,
    pub output: OutputConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            parser: String::new(),
            parser_settings: serde_json::Value::Object(serde_json::Map::new()),
            urls: Vec::new(),
            urls_file: None,
            concurrency: 8,
            max_depth: 0,
            circuit_breaker_threshold: 20,
            cancel_grace_ms: 5_000,
            retry: RetryConfig::default(),
            proxy: ProxyConfig::default(),
            session: SessionConfig::default(),
            politeness: PolitenessConfig::default(),
            request: RequestConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    /// Error kinds worth retrying. Defaults to timeouts, connection and proxy failures,
    /// 5xx and 429.
    pub retry_on: Option<Vec<ErrorKind>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter_ms: 250,
            retry_on: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_attempts)
            .with_backoff(Duration::from_millis(self.base_backoff_ms), self.multiplier)
            .with_max_backoff(Duration::from_millis(self.max_backoff_ms))
            .with_jitter(Duration::from_millis(self.jitter_ms));
        match &self.retry_on {
            Some(kinds) => policy.with_retryable(kinds.iter().copied()),
            None => policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// `[scheme://][user:pass@]host:port` entries.
    pub proxies: Vec<String>,
    pub proxies_file: Option<PathBuf>,
    pub strategy: RotationStrategy,
    pub max_per_proxy: usize,
    pub failure_threshold: f64,
    pub min_samples: u32,
    pub cooldown_ms: u64,
    /// How long the job may go without any eligible proxy before it aborts.
    pub max_wait_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let pool = ProxyPoolConfig::default();
        Self {
            proxies: Vec::new(),
            proxies_file: None,
            strategy: RotationStrategy::default(),
            max_per_proxy: pool.max_concurrent_per_proxy,
            failure_threshold: pool.failure_threshold,
            min_samples: pool.min_samples,
            cooldown_ms: pool.cooldown.as_millis() as u64,
            max_wait_ms: 60_000,
        }
    }
}

impl ProxyConfig {
    pub fn pool_config(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            max_concurrent_per_proxy: self.max_per_proxy,
            failure_threshold: self.failure_threshold,
            min_samples: self.min_samples,
            cooldown: Duration::from_millis(self.cooldown_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub sessions_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sessions_count: SessionPolicy::default().sessions_count,
        }
    }
}

/// Per-domain delay between requests. A zero delay disables throttling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolitenessConfig {
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

impl PolitenessConfig {
    pub fn throttle(&self) -> Option<ThrottleConfig> {
        (self.delay_ms > 0).then(|| {
            ThrottleConfig::new(Duration::from_millis(self.delay_ms))
                .with_jitter(Duration::from_millis(self.jitter_ms))
        })
    }
}

/// HTTP request settings handed to the fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestConfig {
    pub user_agent: Option<String>,
    pub timeout_ms: u64,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_ms: 30_000,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jsonl,
    Csv,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json-lines" | "ndjson" => Ok(OutputFormat::Jsonl),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("Unknown output format: {other} (expected csv or jsonl)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Output file. `None` writes JSON lines to stdout.
    pub path: Option<PathBuf>,
    pub format: OutputFormat,
    pub batch_size: usize,
    /// Record fields identifying duplicates.
    pub primary_keys: Vec<String>,
    /// Records missing any of these (or holding null / empty text) are not stored.
    pub required_fields: Vec<String>,
    pub csv_delimiter: char,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: OutputFormat::default(),
            batch_size: 20,
            primary_keys: vec!["url".to_string()],
            required_fields: Vec::new(),
            csv_delimiter: ',',
        }
    }
}

impl JobConfig {
    /// Load a JSON job file. Relative `urls_file` / `proxies_file` / output paths are
    /// resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("cannot read job file {}: {e}", path.display()))
        })?;
        let mut config: JobConfig = serde_json::from_str(&content).map_err(|e| {
            AppError::ConfigError(format!("invalid job file {}: {e}", path.display()))
        })?;

        if let Some(dir) = path.parent() {
            for file in [
                config.urls_file.as_mut(),
                config.proxy.proxies_file.as_mut(),
                config.output.path.as_mut(),
            ]
            .into_iter()
            .flatten()
            {
                if file.is_relative() {
                    *file = dir.join(&*file);
                }
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.parser.trim().is_empty() {
            return Err(AppError::ConfigError("parser is required".into()));
        }
        if self.urls.is_empty() && self.urls_file.is_none() {
            return Err(AppError::ConfigError(
                "at least one of urls or urls_file is required".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(AppError::ConfigError("concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError("retry.max_attempts must be at least 1".into()));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(AppError::ConfigError("retry.multiplier must be >= 1.0".into()));
        }
        if self.proxy.max_per_proxy == 0 {
            return Err(AppError::ConfigError("proxy.max_per_proxy must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.proxy.failure_threshold) {
            return Err(AppError::ConfigError(
                "proxy.failure_threshold must be in [0, 1)".into(),
            ));
        }
        if self.session.sessions_count == 0 {
            return Err(AppError::ConfigError(
                "session.sessions_count must be at least 1".into(),
            ));
        }
        if self.output.batch_size == 0 {
            return Err(AppError::ConfigError("output.batch_size must be at least 1".into()));
        }
        if self.output.primary_keys.is_empty() {
            return Err(AppError::ConfigError(
                "output.primary_keys must not be empty".into(),
            ));
        }
        if !self.output.csv_delimiter.is_ascii() {
            return Err(AppError::ConfigError(
                "output.csv_delimiter must be an ASCII character".into(),
            ));
        }
        Ok(())
    }

    /// Inline URLs followed by the URL file's entries.
    pub fn seeds(&self) -> Result<Vec<String>, AppError> {
        let mut seeds = self.urls.clone();
        if let Some(path) = &self.urls_file {
            seeds.extend(read_list_file(path)?);
        }
        Ok(seeds)
    }

    /// Validate and resolve into a runnable job.
    pub fn into_job(&self) -> Result<ScrapeJob, AppError> {
        self.validate()?;
        let seeds = self.seeds()?;
        if seeds.is_empty() {
            return Err(AppError::ConfigError("no URLs to scrape".into()));
        }

        let mut job = ScrapeJob::new(&self.parser, seeds)
            .with_parser_settings(self.parser_settings.clone())
            .with_concurrency(self.concurrency)
            .with_retry(self.retry.policy())
            .with_proxy_policy(ProxyPolicy {
                strategy: self.proxy.strategy,
                max_proxy_wait: Duration::from_millis(self.proxy.max_wait_ms),
            })
            .with_sessions(self.session.sessions_count)
            .with_max_depth(self.max_depth)
            .with_breaker_threshold(self.circuit_breaker_threshold)
            .with_cancel_grace(Duration::from_millis(self.cancel_grace_ms))
            .with_batch_size(self.output.batch_size)
            .with_primary_keys(self.output.primary_keys.iter().cloned())
            .with_required_fields(self.output.required_fields.iter().cloned());
        if let Some(throttle) = self.politeness.throttle() {
            job = job.with_throttle(throttle);
        }
        job.validate()?;
        Ok(job)
    }

    /// Proxy pool from the inline list and the proxy file. Empty when neither is set.
    pub fn proxy_pool(&self) -> Result<ProxyPool, AppError> {
        let mut lines = self.proxy.proxies.clone();
        if let Some(path) = &self.proxy.proxies_file {
            lines.extend(read_list_file(path)?);
        }
        let pool = ProxyPool::from_lines(lines, self.proxy.pool_config())?;
        if !pool.is_empty() {
            tracing::info!(proxies = pool.len(), strategy = ?self.proxy.strategy, "Proxy pool loaded");
        }
        Ok(pool)
    }
}
