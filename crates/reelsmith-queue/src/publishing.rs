//! Queue of publish schedules waiting for their publish time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reelsmith_models::{EntryOutcome, ScheduleId};
use reelsmith_store::KvStore;

use crate::backoff::BackoffPolicy;
use crate::error::QueueResult;
use crate::scheduled::{ClaimedEntry, QueueStats, ScheduledQueue};

pub const PUBLISHING_QUEUE: &str = "publishing";

/// Failed publish attempts before a schedule is given up on.
pub const MAX_PUBLISH_RETRIES: u32 = 5;

/// Publishing queue. Members are schedule ids, due at their publish time.
#[derive(Clone)]
pub struct PublishingQueue {
    queue: ScheduledQueue,
}

impl PublishingQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_policy(
            kv,
            BackoffPolicy::new(MAX_PUBLISH_RETRIES, Duration::from_secs(60)),
        )
    }

    pub fn with_policy(kv: Arc<dyn KvStore>, policy: BackoffPolicy) -> Self {
        Self {
            queue: ScheduledQueue::new(kv, PUBLISHING_QUEUE, policy),
        }
    }

    /// Hold claimed entries for `lease` before they may be taken back.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.queue = self.queue.with_lease(lease);
        self
    }

    pub fn queue(&self) -> &ScheduledQueue {
        &self.queue
    }

    /// Queue a schedule for its publish time. Rescheduling moves the due time.
    pub async fn schedule(&self, id: &ScheduleId, publish_at: DateTime<Utc>) -> QueueResult<()> {
        self.queue.enqueue(id.as_str(), publish_at).await
    }

    /// Drop a schedule from the queue. Returns whether it was queued.
    pub async fn cancel(&self, id: &ScheduleId) -> QueueResult<bool> {
        self.queue.remove(id.as_str()).await
    }

    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ClaimedEntry>> {
        self.queue.claim_due(now, limit).await
    }

    /// The schedule was published; the entry is done.
    pub async fn succeed(&self, entry: &ClaimedEntry, url: &str) -> QueueResult<EntryOutcome> {
        self.queue.complete(entry).await?;
        Ok(EntryOutcome::completed(Some(url.to_string())))
    }

    pub async fn fail(
        &self,
        entry: ClaimedEntry,
        error: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<EntryOutcome> {
        self.queue.fail(entry, error, permanent, now).await
    }

    pub async fn restore(&self, entry: &ClaimedEntry) -> QueueResult<()> {
        self.queue.restore(entry).await
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        self.queue.stats(now).await
    }
}
