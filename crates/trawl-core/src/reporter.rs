use std::time::Duration;

use uuid::Uuid;

use crate::job::JobStatus;

/// Events emitted by the engine for monitoring/logging.
#[derive(Debug, Clone)]
pub enum EngineEvent<'a> {
    JobStarted {
        job_id: Uuid,
        parser_id: &'a str,
        seeds: usize,
        concurrency: usize,
    },
    ItemSucceeded {
        url: &'a str,
        attempts: u32,
        records: usize,
        discovered: usize,
    },
    ItemRetrying {
        url: &'a str,
        attempt: u32,
        delay: Duration,
        reason: &'a str,
    },
    ItemFailed {
        url: &'a str,
        attempts: u32,
        reason: &'a str,
    },
    ProxyBackpressure {
        retry_after: Duration,
    },
    BatchStored {
        written: usize,
        rejected: usize,
    },
    CircuitOpened {
        consecutive_failures: u32,
    },
    JobFinished {
        job_id: Uuid,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    },
}

/// Trait for receiving engine events (decoupled logging).
pub trait EngineReporter: Send + Sync {
    fn report(&self, event: EngineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl EngineReporter for TracingReporter {
    fn report(&self, event: EngineEvent<'_>) {
        match event {
            EngineEvent::JobStarted {
                job_id,
                parser_id,
                seeds,
                concurrency,
            } => {
                tracing::info!(%job_id, %parser_id, seeds, concurrency, "Job started");
            }
            EngineEvent::ItemSucceeded {
                url,
                attempts,
                records,
                discovered,
            } => {
                tracing::debug!(%url, attempts, records, discovered, "Item succeeded");
            }
            EngineEvent::ItemRetrying {
                url,
                attempt,
                delay,
                reason,
            } => {
                tracing::info!(
                    %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "Retry scheduled"
                );
            }
            EngineEvent::ItemFailed {
                url,
                attempts,
                reason,
            } => {
                tracing::warn!(%url, attempts, %reason, "Item failed");
            }
            EngineEvent::ProxyBackpressure { retry_after } => {
                tracing::warn!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "No proxy available, pausing dispatch"
                );
            }
            EngineEvent::BatchStored { written, rejected } => {
                tracing::debug!(written, rejected, "Batch stored");
            }
            EngineEvent::CircuitOpened {
                consecutive_failures,
            } => {
                tracing::error!(consecutive_failures, "Circuit breaker opened, aborting job");
            }
            EngineEvent::JobFinished {
                job_id,
                status,
                succeeded,
                failed,
                cancelled,
            } => {
                tracing::info!(%job_id, %status, succeeded, failed, cancelled, "Job finished");
            }
        }
    }
}
