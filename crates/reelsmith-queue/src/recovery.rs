//! Queue of jobs whose pipeline run is pending or was interrupted.
//!
//! Entries are due as soon as they are inserted. An entry first queued more
//! than [`RECOVERY_MAX_AGE_HOURS`] ago is dropped without being run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reelsmith_models::{EntryOutcome, JobId};
use reelsmith_store::KvStore;
use tracing::info;

use crate::backoff::BackoffPolicy;
use crate::error::QueueResult;
use crate::scheduled::{ClaimedEntry, QueueStats, ScheduledQueue};

pub const RECOVERY_QUEUE: &str = "recovery";

pub const RECOVERY_MAX_AGE_HOURS: i64 = 24;

/// Recovery queue. Members are job ids.
#[derive(Clone)]
pub struct RecoveryQueue {
    queue: ScheduledQueue,
    max_age: TimeDelta,
}

impl RecoveryQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_policy(kv, BackoffPolicy::new(5, Duration::from_secs(60)))
    }

    pub fn with_policy(kv: Arc<dyn KvStore>, policy: BackoffPolicy) -> Self {
        Self {
            queue: ScheduledQueue::new(kv, RECOVERY_QUEUE, policy),
            max_age: TimeDelta::hours(RECOVERY_MAX_AGE_HOURS),
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

    /// Queue a job for a (re)run, due immediately.
    pub async fn enqueue(&self, job_id: &JobId) -> QueueResult<()> {
        self.queue.enqueue(job_id.as_str(), Utc::now()).await
    }

    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ClaimedEntry>> {
        self.queue.claim_due(now, limit).await
    }

    /// Whether the entry was first queued too long ago to be worth running.
    pub fn is_expired(&self, entry: &ClaimedEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.meta.enqueued_at) > self.max_age
    }

    /// Drop an expired entry.
    pub async fn expire(&self, entry: &ClaimedEntry) -> QueueResult<EntryOutcome> {
        self.queue.complete(entry).await?;
        info!(job_id = %entry.member, enqueued_at = %entry.meta.enqueued_at, "Recovery entry expired");
        Ok(EntryOutcome::Expired)
    }

    pub async fn succeed(&self, entry: &ClaimedEntry, detail: Option<String>) -> QueueResult<EntryOutcome> {
        self.queue.complete(entry).await?;
        Ok(EntryOutcome::completed(detail))
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

    pub async fn remove(&self, job_id: &JobId) -> QueueResult<bool> {
        self.queue.remove(job_id.as_str()).await
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        self.queue.stats(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelsmith_store::MemoryStore;

    #[tokio::test]
    async fn test_expiry_uses_first_insertion_time() {
        let queue = RecoveryQueue::new(Arc::new(MemoryStore::new()));
        let job_id = JobId::from_string("job-1");
        queue.enqueue(&job_id).await.unwrap();

        let fresh = Utc::now() + TimeDelta::hours(1);
        let entry = queue.claim_due(fresh, 10).await.unwrap().remove(0);
        assert!(!queue.is_expired(&entry, fresh));

        // A requeue does not reset the age
        let entry_outcome = queue.fail(entry, "tts down", false, fresh).await.unwrap();
        assert!(matches!(entry_outcome, EntryOutcome::Requeued { .. }));

        let stale = Utc::now() + TimeDelta::hours(25);
        let entry = queue.claim_due(stale, 10).await.unwrap().remove(0);
        assert!(queue.is_expired(&entry, stale));
        assert_eq!(queue.expire(&entry).await.unwrap(), EntryOutcome::Expired);
        assert!(queue.queue().is_empty().await.unwrap());
    }
}
