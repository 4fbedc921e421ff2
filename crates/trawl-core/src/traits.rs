use std::future::Future;

use crate::error::AppError;
use crate::models::{BatchReport, FetchResult, Page, ParseOutput, ParsedRecord};
use crate::proxy::ProxyAddress;

/// Performs exactly one HTTP attempt. Retries, proxy choice and pacing live in
/// [`HttpTransport`](crate::transport::HttpTransport).
pub trait Fetcher: Send + Sync + Clone + 'static {
    /// Reusable client state (connection pool, cookies) bound to one egress route.
    type Session: Clone + Send + Sync + 'static;

    /// Open a session that sends traffic through `proxy`, or directly when `None`.
    fn open_session(&self, proxy: Option<&ProxyAddress>) -> Result<Self::Session, AppError>;

    /// Fetch `url` once. Failures are reported inside the [`FetchResult`], never panicked.
    fn fetch(
        &self,
        session: &Self::Session,
        url: &str,
    ) -> impl Future<Output = FetchResult> + Send;
}

/// Site-specific extraction logic.
///
/// A returned `ParseError` fails the item; the page is not refetched.
pub trait Parser: Send + Sync {
    fn parse(&self, page: &Page<'_>) -> Result<ParseOutput, AppError>;
}

/// Destination for extracted records.
///
/// The engine calls it from a single writer task only, so implementations need no
/// ordering guarantees of their own.
pub trait StorageSink: Send + Sync + Clone + 'static {
    /// Write one batch. Per-record rejections go in the report; `Err` fails the batch.
    fn write(
        &self,
        records: &[ParsedRecord],
    ) -> impl Future<Output = Result<BatchReport, AppError>> + Send;

    fn flush(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A sink that discards everything, for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StorageSink for NullSink {
    async fn write(&self, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
        Ok(BatchReport::all_written(records.len()))
    }

    async fn flush(&self) -> Result<(), AppError> {
        Ok(())
    }
}
