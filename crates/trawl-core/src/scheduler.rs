//! Bounded-concurrency work queue with dedup, timed retries and backpressure.
//!
//! ```text
//! submit ──> ready ──(worker)──> in-flight ──> complete
//!              ^                     │
//!              └──── delayed <───────┘ retry_after(delay)
//! ```
//!
//! Exactly `concurrency` worker tasks pull from the ready queue. Workers can submit
//! discovered URLs while running; the queue is unbounded, so submission never blocks.
//! The run ends once nothing is ready, delayed or in flight, or when the scheduler is
//! aborted or cancelled.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::models::{ItemState, WorkItem};
use crate::util::normalize_url;

/// Why a submitted URL was or was not queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The dedup key was already seen in this job.
    Duplicate,
    TooDeep,
    InvalidUrl(String),
    /// The scheduler has been drained, aborted or cancelled.
    Closed,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// What a handler wants done with the item it was given.
#[derive(Debug)]
pub enum Disposition {
    /// Terminal; the item's `state` says how it ended.
    Done(WorkItem),
    /// Try again after the delay.
    Retry(WorkItem, Duration),
    /// Put back at the front of the queue without counting an attempt.
    Requeue(WorkItem),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub seen: usize,
    /// Highest number of items in flight at once.
    pub max_in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Result of a finished [`run`](RequestScheduler::run).
#[derive(Debug, Default)]
pub struct SchedulerReport {
    /// Items that never reached a terminal state through a handler.
    pub cancelled: Vec<WorkItem>,
    pub stats: SchedulerStats,
}

struct Delayed {
    due: Instant,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so the earliest due item sits on top of the max-heap.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    ready: VecDeque<WorkItem>,
    delayed: BinaryHeap<Delayed>,
    seen: HashSet<String>,
    in_flight: HashMap<String, WorkItem>,
    cancelled: Vec<WorkItem>,
    paused_until: Option<Instant>,
    closed: bool,
    seq: u64,
    max_in_flight: usize,
    succeeded: usize,
    failed: usize,
}

impl SchedulerState {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(Delayed { mut item, .. }) = self.delayed.pop() {
                item.state = ItemState::Pending;
                self.ready.push_back(item);
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight.is_empty()
    }

    fn cancel(&mut self, mut item: WorkItem) {
        item.state = ItemState::Cancelled;
        self.cancelled.push(item);
    }

    fn cancel_pending(&mut self) {
        let ready: Vec<_> = self.ready.drain(..).collect();
        for item in ready {
            self.cancel(item);
        }
        let delayed: Vec<_> = self.delayed.drain().map(|d| d.item).collect();
        for item in delayed {
            self.cancel(item);
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ready: self.ready.len(),
            delayed: self.delayed.len(),
            in_flight: self.in_flight.len(),
            seen: self.seen.len(),
            max_in_flight: self.max_in_flight,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }
}

pub struct RequestScheduler {
    max_depth: u32,
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl RequestScheduler {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
        }
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scheduler mutex");
            poisoned.into_inner()
        })
    }

    /// Queue `url` unless its dedup key was already seen or it is too deep.
    pub fn submit(&self, url: &str, depth: u32, parent: Option<&str>) -> SubmitOutcome {
        let key = match normalize_url(url) {
            Ok(key) => key,
            Err(e) => return SubmitOutcome::InvalidUrl(e.to_string()),
        };

        {
            let mut state = self.lock_state();
            if state.closed {
                return SubmitOutcome::Closed;
            }
            if depth > self.max_depth {
                return SubmitOutcome::TooDeep;
            }
            if !state.seen.insert(key.clone()) {
                return SubmitOutcome::Duplicate;
            }
            let mut item = WorkItem::new(url.trim(), key, depth);
            if let Some(parent) = parent {
                item = item.with_parent(parent);
            }
            state.ready.push_back(item);
        }
        self.notify.notify_waiters();
        SubmitOutcome::Accepted
    }

    /// Release an in-flight item and re-queue it once `delay` elapses.
    pub fn retry_after(&self, mut item: WorkItem, delay: Duration) {
        {
            let mut state = self.lock_state();
            state.in_flight.remove(&item.key);
            if state.closed {
                state.cancel(item);
            } else {
                item.state = ItemState::Retrying;
                state.seq += 1;
                let seq = state.seq;
                state.delayed.push(Delayed {
                    due: Instant::now() + delay,
                    seq,
                    item,
                });
            }
        }
        self.notify.notify_waiters();
    }

    /// Release an in-flight item straight back to the front of the queue.
    pub fn requeue(&self, mut item: WorkItem) {
        {
            let mut state = self.lock_state();
            state.in_flight.remove(&item.key);
            if state.closed {
                state.cancel(item);
            } else {
                item.state = ItemState::Pending;
                state.ready.push_front(item);
            }
        }
        self.notify.notify_waiters();
    }

    /// Stop handing out work until `duration` has elapsed.
    pub fn pause_for(&self, duration: Duration) {
        {
            let mut state = self.lock_state();
            let until = Instant::now() + duration;
            state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
        }
        self.notify.notify_waiters();
    }

    /// Record a terminal item and free its in-flight slot.
    pub fn complete(&self, item: WorkItem) {
        {
            let mut state = self.lock_state();
            state.in_flight.remove(&item.key);
            match item.state {
                ItemState::Succeeded => state.succeeded += 1,
                ItemState::PermanentlyFailed => state.failed += 1,
                ItemState::Cancelled => state.cancelled.push(item),
                other => {
                    tracing::warn!(url = %item.url, state = %other, "Completed item is not terminal");
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Drop all queued and delayed items as Cancelled and stop handing out work.
    /// In-flight items finish normally.
    pub fn abort(&self) {
        {
            let mut state = self.lock_state();
            state.closed = true;
            state.cancel_pending();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn stats(&self) -> SchedulerStats {
        self.lock_state().stats()
    }

    /// Wait for the next ready item. `None` once drained, closed or cancelled.
    async fn next(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            // Registered before checking state so no notification is missed.
            let notified = self.notify.notified();

            let wake_at = {
                let mut state = self.lock_state();
                if state.closed || cancel.is_cancelled() {
                    return None;
                }
                let now = Instant::now();
                state.promote_due(now);

                let paused_until = state.paused_until.filter(|p| *p > now);
                if paused_until.is_none()
                    && let Some(mut item) = state.ready.pop_front()
                {
                    item.state = ItemState::InFlight;
                    state.in_flight.insert(item.key.clone(), item.clone());
                    state.max_in_flight = state.max_in_flight.max(state.in_flight.len());
                    return Some(item);
                }

                if state.is_drained() {
                    state.closed = true;
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }

                let next_due = state.delayed.peek().map(|d| d.due);
                match (paused_until, next_due) {
                    (Some(p), Some(d)) => Some(p.max(d)),
                    (Some(p), None) => Some(p),
                    (None, d) => d,
                }
            };

            tokio::select! {
                () = notified => {}
                () = sleep_until(wake_at) => {}
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Run exactly `concurrency` workers until the queue drains, the scheduler is
    /// aborted, or `cancel` fires.
    ///
    /// On cancellation nothing new is dequeued, queued and delayed items are
    /// cancelled, and in-flight handlers get `grace` to finish before they are
    /// abandoned and their items reported Cancelled.
    pub async fn run<H, Fut>(
        self: &Arc<Self>,
        concurrency: usize,
        cancel: CancellationToken,
        grace: Duration,
        handler: H,
    ) -> SchedulerReport
    where
        H: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Disposition> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency.max(1) {
            let scheduler = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            workers.spawn(
                async move {
                    while let Some(item) = scheduler.next(&cancel).await {
                        match handler(item).await {
                            Disposition::Done(item) => scheduler.complete(item),
                            Disposition::Retry(item, delay) => scheduler.retry_after(item, delay),
                            Disposition::Requeue(item) => scheduler.requeue(item),
                        }
                    }
                    tracing::trace!(worker_id, "Worker exiting");
                }
                .in_current_span(),
            );
        }

        let cancelled = tokio::select! {
            () = join_all(&mut workers) => false,
            () = cancel.cancelled() => true,
        };

        if cancelled {
            tracing::info!(grace_ms = grace.as_millis() as u64, "Cancellation requested, draining");
            self.abort();
            if tokio::time::timeout(grace, join_all(&mut workers)).await.is_err() {
                workers.abort_all();
                join_all(&mut workers).await;
                let mut state = self.lock_state();
                let abandoned: Vec<_> = state.in_flight.drain().map(|(_, item)| item).collect();
                if !abandoned.is_empty() {
                    tracing::warn!(count = abandoned.len(), "Abandoned in-flight items after grace period");
                }
                for item in abandoned {
                    state.cancel(item);
                }
            }
        }

        let mut state = self.lock_state();
        state.closed = true;
        state.cancel_pending();
        SchedulerReport {
            cancelled: std::mem::take(&mut state.cancelled),
            stats: state.stats(),
        }
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined
            && e.is_panic()
        {
            tracing::error!(error = %e, "Scheduler worker panicked");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
