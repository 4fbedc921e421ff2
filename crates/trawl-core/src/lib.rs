pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod throttle;
pub mod traits;
pub mod transport;
pub mod util;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{JobConfig, OutputFormat};
pub use engine::ScrapeEngine;
pub use error::AppError;
pub use job::{JobFailure, JobStatus, JobSummary, ScrapeJob};
pub use models::{FetchResult, Page, ParseOutput, ParsedRecord, WorkItem, compute_hash};
pub use proxy::{ProxyPool, RotationStrategy};
pub use registry::ParserRegistry;
pub use retry::RetryPolicy;
pub use traits::{Fetcher, Parser, StorageSink};
pub use transport::HttpTransport;
