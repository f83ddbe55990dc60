//! Budget-bounded, single-flight batch processing.
//!
//! Items wait in a priority heap (priority descending, insertion order
//! ascending). A batch runs up to `max_batch_size` of them one at a time,
//! checking the elapsed wall-clock time before popping each item. Items are
//! only taken off the heap when they start, so when the budget is spent (or
//! the batch future is dropped) the untouched ones are still there, in order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};

/// Batch configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Wall-clock budget for one batch
    pub max_processing_time: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_processing_time: Duration::from_secs(50),
        }
    }
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Items returned to the heap unprocessed
    pub deferred: usize,
    pub budget_exhausted: bool,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Per-item work run by a batch.
#[async_trait]
pub trait BatchHandler<T: Send + Sync>: Send + Sync {
    type Output: Send;
    type Error: Display + Send + Sync;

    async fn handle(&self, item: &T) -> Result<Self::Output, Self::Error>;

    async fn on_success(&self, _item: &T, _output: Self::Output) {}

    async fn on_error(&self, _item: &T, _error: &Self::Error) {}
}

struct Queued<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    // Max-heap: higher priority first, then lower sequence
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Single-flight batch processor.
pub struct BatchProcessor<T> {
    config: BatchConfig,
    heap: Mutex<BinaryHeap<Queued<T>>>,
    seq: AtomicU64,
    in_flight: AtomicBool,
}

impl<T: Send + Sync> BatchProcessor<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Add an item.
    pub async fn push(&self, item: T, priority: i32) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().await.push(Queued {
            priority,
            seq,
            item,
        });
    }

    /// Items waiting.
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.load(AtomicOrdering::Acquire)
    }

    /// Take the single-flight slot. Fails fast if a batch is in flight.
    pub fn begin(&self) -> QueueResult<BatchGuard<'_, T>> {
        self.in_flight
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .map_err(|_| QueueError::AlreadyProcessing)?;
        Ok(BatchGuard { processor: self })
    }

    /// Run one batch with the given handler.
    pub async fn process_batch<H>(&self, handler: &H) -> QueueResult<BatchReport>
    where
        H: BatchHandler<T>,
    {
        let guard = self.begin()?;
        Ok(guard.run(handler).await)
    }

    async fn pop(&self) -> Option<Queued<T>> {
        self.heap.lock().await.pop()
    }
}

/// Holds the single-flight slot until dropped.
pub struct BatchGuard<'a, T> {
    processor: &'a BatchProcessor<T>,
}

impl<T: Send + Sync> BatchGuard<'_, T> {
    pub async fn push(&self, item: T, priority: i32) {
        self.processor.push(item, priority).await;
    }

    /// Run up to `max_batch_size` items within the time budget.
    pub async fn run<H>(&self, handler: &H) -> BatchReport
    where
        H: BatchHandler<T>,
    {
        self.run_from(handler, Instant::now()).await
    }

    /// Like [`run`](Self::run), with the budget counted from `started`, so
    /// work done before the batch (claiming, loading) is charged to it.
    pub async fn run_from<H>(&self, handler: &H, started: Instant) -> BatchReport
    where
        H: BatchHandler<T>,
    {
        let config = self.processor.config;
        let mut report = BatchReport::default();

        while report.processed() < config.max_batch_size {
            if started.elapsed() >= config.max_processing_time {
                let waiting = self.processor.len().await;
                report.deferred = waiting.min(config.max_batch_size - report.processed());
                report.budget_exhausted = report.deferred > 0;
                if report.budget_exhausted {
                    warn!(
                        deferred = report.deferred,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Batch budget exhausted, deferring remainder"
                    );
                }
                break;
            }

            let Some(queued) = self.processor.pop().await else {
                break;
            };

            match handler.handle(&queued.item).await {
                Ok(output) => {
                    report.succeeded += 1;
                    handler.on_success(&queued.item, output).await;
                }
                Err(e) => {
                    report.failed += 1;
                    debug!(error = %e, "Batch item failed");
                    handler.on_error(&queued.item, &e).await;
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch finished"
        );
        report
    }

    /// Remove every waiting item, highest priority first.
    pub async fn drain(&self) -> Vec<T> {
        let mut heap = self.processor.heap.lock().await;
        let mut drained = Vec::with_capacity(heap.len());
        while let Some(queued) = heap.pop() {
            drained.push(queued.item);
        }
        drained
    }
}

impl<T> Drop for BatchGuard<'_, T> {
    fn drop(&mut self) {
        self.processor.in_flight.store(false, AtomicOrdering::Release);
    }
}
