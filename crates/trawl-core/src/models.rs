use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Lifecycle of a single URL within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    PermanentlyFailed,
    Cancelled,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InFlight => "in_flight",
            ItemState::Retrying => "retrying",
            ItemState::Succeeded => "succeeded",
            ItemState::PermanentlyFailed => "permanently_failed",
            ItemState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::PermanentlyFailed | ItemState::Cancelled
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One URL's unit of work within a job.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub url: String,
    /// Normalized URL used for dedup.
    pub key: String,
    pub depth: u32,
    pub attempts: u32,
    /// URL of the page this one was discovered on.
    pub parent: Option<String>,
    pub state: ItemState,
    /// Delay applied before the most recent retry.
    #[serde(skip)]
    pub last_backoff: Duration,
}

impl WorkItem {
    pub fn new(url: impl Into<String>, key: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            depth,
            attempts: 0,
            parent: None,
            state: ItemState::Pending,
            last_backoff: Duration::ZERO,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Classification of a failed fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    ServerError,
    RateLimited,
    ClientError,
    UnexpectedStatus,
    UnsupportedContentType,
    Body,
    Proxy,
}

impl ErrorKind {
    /// Maps a non-2xx status code to its error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerError,
            400..=499 => ErrorKind::ClientError,
            _ => ErrorKind::UnexpectedStatus,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::ServerError => "server_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ClientError => "client_error",
            ErrorKind::UnexpectedStatus => "unexpected_status",
            ErrorKind::UnsupportedContentType => "unsupported_content_type",
            ErrorKind::Body => "body",
            ErrorKind::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Success / transient / permanent classification of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Outcome of one fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub outcome: FetchOutcome,
    pub status: Option<u16>,
    pub body: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub elapsed: Duration,
    pub proxy: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    /// Server-provided `Retry-After`, if any.
    pub retry_after: Option<Duration>,
}

impl FetchResult {
    /// Builds a result from a received HTTP response.
    ///
    /// The outcome is provisional; the transport reclassifies it against its retry policy.
    pub fn from_status(
        url: impl Into<String>,
        status: u16,
        body: impl Into<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        let url = url.into();
        let retry_after = headers.get("retry-after").and_then(|v| parse_retry_after(v));
        let (outcome, error_kind, error) = if (200..300).contains(&status) {
            (FetchOutcome::Success, None, None)
        } else {
            let kind = ErrorKind::from_status(status);
            (
                default_outcome(kind),
                Some(kind),
                Some(format!("HTTP {status}")),
            )
        };

        Self {
            final_url: url.clone(),
            url,
            outcome,
            status: Some(status),
            body: body.into(),
            headers,
            elapsed: Duration::ZERO,
            proxy: None,
            error_kind,
            error,
            retry_after,
        }
    }

    /// Builds a result for an attempt that produced no usable response.
    pub fn from_error(url: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            outcome: default_outcome(kind),
            status: None,
            body: String::new(),
            headers: HashMap::new(),
            elapsed: Duration::ZERO,
            proxy: None,
            error_kind: Some(kind),
            error: Some(message.into()),
            retry_after: None,
        }
    }

    pub fn with_final_url(mut self, final_url: impl Into<String>) -> Self {
        self.final_url = final_url.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == FetchOutcome::Success
    }

    /// The failure as an [`AppError`], or `None` for a successful attempt.
    pub fn error(&self) -> Option<AppError> {
        let message = || self.error.clone().unwrap_or_else(|| self.failure_reason());
        match (self.outcome, self.error_kind) {
            (FetchOutcome::Success, _) => None,
            (_, Some(ErrorKind::UnsupportedContentType)) => {
                Some(AppError::UnsupportedContentType(message()))
            }
            (FetchOutcome::PermanentFailure, _) if self.status.is_some_and(|s| s >= 400) => {
                Some(AppError::PermanentHttpError {
                    status: self.status.unwrap_or_default(),
                    url: self.url.clone(),
                })
            }
            (FetchOutcome::TransientFailure, kind) => Some(AppError::TransientNetworkError {
                kind: kind.unwrap_or(ErrorKind::Connection),
                message: message(),
            }),
            (FetchOutcome::PermanentFailure, _) => Some(AppError::HttpError(self.failure_reason())),
        }
    }

    /// Human-readable failure reason for summaries and logs.
    pub fn failure_reason(&self) -> String {
        match (&self.error_kind, &self.error) {
            (Some(kind), Some(msg)) => format!("{kind}: {msg}"),
            (Some(kind), None) => kind.to_string(),
            (None, Some(msg)) => msg.clone(),
            (None, None) => "unknown failure".to_string(),
        }
    }
}

fn default_outcome(kind: ErrorKind) -> FetchOutcome {
    match kind {
        ErrorKind::Timeout
        | ErrorKind::Connection
        | ErrorKind::ServerError
        | ErrorKind::RateLimited
        | ErrorKind::Proxy => FetchOutcome::TransientFailure,
        ErrorKind::ClientError
        | ErrorKind::UnexpectedStatus
        | ErrorKind::UnsupportedContentType
        | ErrorKind::Body => FetchOutcome::PermanentFailure,
    }
}

/// Parses a `Retry-After` value given in seconds. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// A fetched page handed to a parser.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    pub url: &'a str,
    pub status: u16,
    pub headers: &'a HashMap<String, String>,
    pub body: &'a str,
}

/// One extracted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub source_url: String,
    pub scraped_at: DateTime<Utc>,
}

impl ParsedRecord {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            fields: serde_json::Map::new(),
            source_url: source_url.into(),
            scraped_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// SHA-256 over the values of `keys`, used to drop duplicate records.
    ///
    /// A record carrying none of `keys` is identified by all of its fields instead.
    pub fn fingerprint(&self, keys: &[String]) -> String {
        if !keys.iter().any(|key| self.fields.contains_key(key)) {
            return compute_hash(&serde_json::Value::Object(self.fields.clone()).to_string());
        }
        let parts: Vec<String> = keys
            .iter()
            .map(|key| match self.fields.get(key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            })
            .collect();
        compute_hash(&parts.join("\u{1f}"))
    }

    /// The first of `required` that is absent, null or an empty string.
    pub fn missing_field<'a>(&self, required: &'a [String]) -> Option<&'a str> {
        required
            .iter()
            .find(|name| match self.fields.get(name.as_str()) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .map(String::as_str)
    }
}

/// Everything a parser yields for one page.
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub records: Vec<ParsedRecord>,
    /// Follow-up URLs, absolute or relative to the page URL.
    pub discovered: Vec<String>,
}

impl ParseOutput {
    pub fn new(records: Vec<ParsedRecord>, discovered: Vec<String>) -> Self {
        Self {
            records,
            discovered,
        }
    }
}

/// A single record the sink could not write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    /// Index into the submitted batch.
    pub index: usize,
    pub reason: String,
}

/// Per-record result of a sink write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub written: usize,
    pub failed: Vec<RecordFailure>,
}

impl BatchReport {
    pub fn all_written(count: usize) -> Self {
        Self {
            written: count,
            failed: Vec::new(),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
