//! Time-ordered durable queue over a store sorted set.
//!
//! Members are scored by their due time in epoch milliseconds. Claiming an
//! entry moves it from the due set into the claimed set under a lease; only
//! the caller whose `zrem` removed the member owns it, so overlapping
//! triggers never process the same entry twice. Settling an entry (complete,
//! requeue, dead-letter, restore) takes it out of the claimed set. An entry
//! whose owner died keeps its lease until it expires, and the next claim puts
//! it back in the due set.
//!
//! Keys (before the store prefix):
//! - `queue:{name}`: due set
//! - `queue:{name}:claimed`: claimed set, scored by lease expiry
//! - `queue:{name}:dead`: dead-letter set, scored by time of death
//! - `queue:{name}:meta:{member}`: entry metadata (JSON, with TTL)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reelsmith_models::EntryOutcome;
use reelsmith_store::KvStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, FailureDecision};
use crate::error::QueueResult;

/// Metadata lives a week; long enough to outlast any backoff chain.
const META_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Dead-lettered metadata is kept for inspection.
const DEAD_META_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// How long a claim is held before another caller may take the entry back.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(120);

/// Expired claims returned to the due set per claim call.
const RECLAIM_LIMIT: usize = 100;

/// Side metadata of a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// First insertion time; survives requeues
    pub enqueued_at: DateTime<Utc>,
    /// Consecutive failures
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl EntryMeta {
    pub fn new(enqueued_at: DateTime<Utc>) -> Self {
        Self {
            enqueued_at,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// An entry this caller moved from the due set and holds a lease on.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub member: String,
    /// Score the entry had when claimed
    pub score: f64,
    /// Lease expiry in the claimed set; identifies this claim
    pub lease_until: f64,
    pub meta: EntryMeta,
}

impl ClaimedEntry {
    /// Due time the entry had when claimed.
    pub fn due_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.score as i64).unwrap_or(self.meta.enqueued_at)
    }
}

/// Queue sizes for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub due: u64,
    /// Entries held under a lease by a running trigger
    pub claimed: u64,
    pub dead_lettered: u64,
}

fn score_of(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// A named time-ordered queue.
#[derive(Clone)]
pub struct ScheduledQueue {
    kv: Arc<dyn KvStore>,
    name: String,
    policy: BackoffPolicy,
    lease: Duration,
}

impl ScheduledQueue {
    pub fn new(kv: Arc<dyn KvStore>, name: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            kv,
            name: name.into(),
            policy,
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn due_key(&self) -> String {
        format!("queue:{}", self.name)
    }

    fn claimed_key(&self) -> String {
        format!("queue:{}:claimed", self.name)
    }

    fn dead_key(&self) -> String {
        format!("queue:{}:dead", self.name)
    }

    fn meta_key(&self, member: &str) -> String {
        format!("queue:{}:meta:{}", self.name, member)
    }

    /// Read an entry's metadata.
    pub async fn meta(&self, member: &str) -> QueueResult<Option<EntryMeta>> {
        match self.kv.get(&self.meta_key(member)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn save_meta(&self, member: &str, meta: &EntryMeta, ttl: Duration) -> QueueResult<()> {
        let payload = serde_json::to_string(meta)?;
        self.kv.set(&self.meta_key(member), &payload, Some(ttl)).await?;
        Ok(())
    }

    /// Insert or reschedule an entry.
    ///
    /// Existing metadata is kept, so re-enqueueing a member does not reset its
    /// age or retry count.
    pub async fn enqueue(&self, member: &str, due_at: DateTime<Utc>) -> QueueResult<()> {
        if self.meta(member).await?.is_none() {
            self.save_meta(member, &EntryMeta::new(Utc::now()), META_TTL)
                .await?;
        }
        self.kv.zadd(&self.due_key(), member, score_of(due_at)).await?;
        debug!(queue = %self.name, member, due_at = %due_at, "Enqueued entry");
        Ok(())
    }

    /// Due time of a queued member.
    pub async fn due_at(&self, member: &str) -> QueueResult<Option<DateTime<Utc>>> {
        let score = self.kv.zscore(&self.due_key(), member).await?;
        Ok(score.and_then(|s| DateTime::from_timestamp_millis(s as i64)))
    }

    /// Claim up to `limit` entries due at `now`, earliest first.
    ///
    /// Expired leases are returned to the due set first. Entries another
    /// caller removed between the range read and the remove are skipped.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<ClaimedEntry>> {
        self.reclaim_expired(now).await?;

        let candidates = self
            .kv
            .zrange_by_score(&self.due_key(), f64::NEG_INFINITY, score_of(now), limit)
            .await?;
        let lease_until = score_of(
            now.checked_add_signed(self.lease_delta())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );

        let mut claimed = Vec::with_capacity(candidates.len());
        for (member, score) in candidates {
            if !self.kv.zrem(&self.due_key(), &member).await? {
                debug!(queue = %self.name, member = %member, "Entry claimed elsewhere");
                continue;
            }
            if let Err(e) = self.kv.zadd(&self.claimed_key(), &member, lease_until).await {
                self.kv.zadd(&self.due_key(), &member, score).await?;
                return Err(e.into());
            }
            let meta = match self.meta(&member).await {
                Ok(Some(meta)) => meta,
                Ok(None) => EntryMeta::new(
                    DateTime::from_timestamp_millis(score as i64).unwrap_or(now),
                ),
                Err(e) => {
                    self.release(&member, lease_until, score).await?;
                    return Err(e);
                }
            };
            claimed.push(ClaimedEntry {
                member,
                score,
                lease_until,
                meta,
            });
        }

        if !claimed.is_empty() {
            info!(queue = %self.name, count = claimed.len(), "Claimed due entries");
        }
        Ok(claimed)
    }

    /// Return entries whose lease ran out to the due set, due at once.
    ///
    /// Returns how many were reclaimed.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let expired = self
            .kv
            .zrange_by_score(&self.claimed_key(), f64::NEG_INFINITY, score_of(now), RECLAIM_LIMIT)
            .await?;

        let mut reclaimed = 0;
        for (member, lease_until) in expired {
            if !self.kv.zrem(&self.claimed_key(), &member).await? {
                continue;
            }
            self.kv.zadd(&self.due_key(), &member, lease_until).await?;
            reclaimed += 1;
            warn!(queue = %self.name, member = %member, "Reclaimed entry with expired lease");
        }
        Ok(reclaimed)
    }

    fn lease_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.lease).unwrap_or(TimeDelta::MAX)
    }

    /// Whether the claimed set still holds this exact claim.
    async fn holds(&self, member: &str, lease_until: f64) -> QueueResult<bool> {
        Ok(self.kv.zscore(&self.claimed_key(), member).await? == Some(lease_until))
    }

    /// Drop the lease and put the member back at `score`, if still held.
    async fn release(&self, member: &str, lease_until: f64, score: f64) -> QueueResult<bool> {
        if !self.holds(member, lease_until).await?
            || !self.kv.zrem(&self.claimed_key(), member).await?
        {
            return Ok(false);
        }
        self.kv.zadd(&self.due_key(), member, score).await?;
        Ok(true)
    }

    /// Re-insert an entry with a new due time and its updated metadata.
    pub async fn requeue(&self, entry: &ClaimedEntry, due_at: DateTime<Utc>) -> QueueResult<()> {
        self.save_meta(&entry.member, &entry.meta, META_TTL).await?;
        self.kv
            .zadd(&self.due_key(), &entry.member, score_of(due_at))
            .await?;
        self.kv.zrem(&self.claimed_key(), &entry.member).await?;
        Ok(())
    }

    /// Put an untouched entry back with its original score.
    ///
    /// Does nothing if the lease was lost and the entry already went back.
    pub async fn restore(&self, entry: &ClaimedEntry) -> QueueResult<()> {
        if !self.release(&entry.member, entry.lease_until, entry.score).await? {
            debug!(queue = %self.name, member = %entry.member, "Lease already released");
        }
        Ok(())
    }

    /// Finish an entry: release its lease and drop its metadata.
    pub async fn complete(&self, entry: &ClaimedEntry) -> QueueResult<()> {
        self.kv.zrem(&self.claimed_key(), &entry.member).await?;
        self.kv.delete(&self.meta_key(&entry.member)).await?;
        Ok(())
    }

    /// Move an entry to the dead-letter set.
    pub async fn dead_letter(&self, entry: &ClaimedEntry, now: DateTime<Utc>) -> QueueResult<()> {
        self.save_meta(&entry.member, &entry.meta, DEAD_META_TTL)
            .await?;
        self.kv
            .zadd(&self.dead_key(), &entry.member, score_of(now))
            .await?;
        self.kv.zrem(&self.claimed_key(), &entry.member).await?;
        warn!(
            queue = %self.name,
            member = %entry.member,
            retry_count = entry.meta.retry_count,
            "Entry dead-lettered"
        );
        Ok(())
    }

    /// Record a handler failure and requeue or dead-letter the entry.
    pub async fn fail(
        &self,
        mut entry: ClaimedEntry,
        error: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<EntryOutcome> {
        entry.meta.retry_count += 1;
        entry.meta.last_error = Some(error.to_string());
        let retry_count = entry.meta.retry_count;

        match self.policy.decide(retry_count, permanent, now) {
            FailureDecision::Requeue { due_at } => {
                self.requeue(&entry, due_at).await?;
                info!(
                    queue = %self.name,
                    member = %entry.member,
                    retry_count,
                    due_at = %due_at,
                    "Entry requeued with backoff"
                );
                Ok(EntryOutcome::Requeued {
                    retry_count,
                    due_at,
                    error: error.to_string(),
                })
            }
            FailureDecision::DeadLetter => {
                self.dead_letter(&entry, now).await?;
                Ok(EntryOutcome::DeadLettered {
                    retry_count,
                    error: error.to_string(),
                })
            }
        }
    }

    /// Forget a member entirely: due, claimed and dead-letter sets and
    /// metadata. Returns whether it was queued or claimed.
    pub async fn remove(&self, member: &str) -> QueueResult<bool> {
        let due = self.kv.zrem(&self.due_key(), member).await?;
        let claimed = self.kv.zrem(&self.claimed_key(), member).await?;
        let removed = due || claimed;
        self.kv.zrem(&self.dead_key(), member).await?;
        self.kv.delete(&self.meta_key(member)).await?;
        Ok(removed)
    }

    /// Entries in the due set, due or not.
    pub async fn len(&self) -> QueueResult<u64> {
        Ok(self.kv.zcard(&self.due_key()).await?)
    }

    pub async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Entries due at `now`.
    pub async fn due_len(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        Ok(self
            .kv
            .zcount(&self.due_key(), f64::NEG_INFINITY, score_of(now))
            .await?)
    }

    /// Entries currently held under a lease.
    pub async fn claimed_len(&self) -> QueueResult<u64> {
        Ok(self.kv.zcard(&self.claimed_key()).await?)
    }

    pub async fn dead_letter_len(&self) -> QueueResult<u64> {
        Ok(self.kv.zcard(&self.dead_key()).await?)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            total: self.len().await?,
            due: self.due_len(now).await?,
            claimed: self.claimed_len().await?,
            dead_lettered: self.dead_letter_len().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelsmith_store::MemoryStore;

    fn queue() -> ScheduledQueue {
        ScheduledQueue::new(Arc::new(MemoryStore::new()), "test", BackoffPolicy::default())
    }

    #[tokio::test]
    async fn test_claim_only_due_entries_in_order() {
        let queue = queue();
        let now = Utc::now();
        queue.enqueue("late", now + TimeDelta::hours(1)).await.unwrap();
        queue.enqueue("b", now - TimeDelta::seconds(5)).await.unwrap();
        queue.enqueue("a", now - TimeDelta::seconds(10)).await.unwrap();

        assert_eq!(queue.due_len(now).await.unwrap(), 2);

        let claimed = queue.claim_due(now, 10).await.unwrap();
        let members: Vec<_> = claimed.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["a", "b"]);

        // Claimed entries are gone; a second claim gets nothing
        assert!(queue.claim_due(now, 10).await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restore_keeps_original_due_time() {
        let queue = queue();
        let due = Utc::now() - TimeDelta::seconds(30);
        queue.enqueue("a", due).await.unwrap();

        let entry = queue.claim_due(Utc::now(), 1).await.unwrap().remove(0);
        queue.restore(&entry).await.unwrap();

        assert_eq!(
            queue.due_at("a").await.unwrap().map(|d| d.timestamp_millis()),
            Some(due.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_fail_requeues_then_dead_letters() {
        let queue = ScheduledQueue::new(
            Arc::new(MemoryStore::new()),
            "test",
            BackoffPolicy::new(2, Duration::from_secs(60)),
        );
        let now = Utc::now();
        queue.enqueue("a", now).await.unwrap();

        let entry = queue.claim_due(now, 1).await.unwrap().remove(0);
        let outcome = queue.fail(entry, "quota", false, now).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Requeued { retry_count: 1, .. }));
        assert_eq!(
            queue.due_at("a").await.unwrap().map(|d| d.timestamp_millis()),
            Some((now + TimeDelta::minutes(2)).timestamp_millis())
        );

        let later = now + TimeDelta::minutes(3);
        let entry = queue.claim_due(later, 1).await.unwrap().remove(0);
        assert_eq!(entry.meta.retry_count, 1);
        let outcome = queue.fail(entry, "quota", false, later).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::DeadLettered { retry_count: 2, .. }));

        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_len().await.unwrap(), 1);
        let meta = queue.meta("a").await.unwrap().unwrap();
        assert_eq!(meta.last_error.as_deref(), Some("quota"));
    }

    #[tokio::test]
    async fn test_enqueue_keeps_existing_meta() {
        let queue = queue();
        let now = Utc::now();
        queue.enqueue("a", now).await.unwrap();
        let first = queue.meta("a").await.unwrap().unwrap();

        queue.enqueue("a", now + TimeDelta::minutes(5)).await.unwrap();
        let second = queue.meta("a").await.unwrap().unwrap();
        assert_eq!(first.enqueued_at, second.enqueued_at);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_claim_returns_after_lease() {
        let queue = queue().with_lease(Duration::from_secs(120));
        let now = Utc::now();
        queue.enqueue("a", now).await.unwrap();
        queue.enqueue("b", now).await.unwrap();

        // Claimed by a caller that never settles them
        let claimed = queue.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.claimed_len().await.unwrap(), 2);

        // Still leased
        let soon = now + TimeDelta::seconds(60);
        assert!(queue.claim_due(soon, 10).await.unwrap().is_empty());

        let later = now + TimeDelta::seconds(121);
        let reclaimed = queue.claim_due(later, 10).await.unwrap();
        let mut members: Vec<_> = reclaimed.iter().map(|e| e.member.as_str()).collect();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        assert_eq!(queue.claimed_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_settling_releases_lease() {
        let queue = queue();
        let now = Utc::now();
        for member in ["done", "retry", "dead", "back"] {
            queue.enqueue(member, now).await.unwrap();
        }
        let mut claimed = queue.claim_due(now, 10).await.unwrap();
        claimed.sort_by(|a, b| a.member.cmp(&b.member));
        let [back, dead, done, retry]: [ClaimedEntry; 4] = claimed.try_into().unwrap();

        queue.complete(&done).await.unwrap();
        queue.requeue(&retry, now + TimeDelta::minutes(1)).await.unwrap();
        queue.dead_letter(&dead, now).await.unwrap();
        queue.restore(&back).await.unwrap();

        let stats = queue.stats(now).await.unwrap();
        assert_eq!(stats.claimed, 0);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.due, 1);
        assert_eq!(stats.dead_lettered, 1);

        // A lease past its expiry brings nothing back once settled
        let later = now + TimeDelta::hours(1);
        queue.reclaim_expired(later).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restore_after_lost_lease_is_noop() {
        let queue = queue().with_lease(Duration::from_secs(10));
        let now = Utc::now();
        queue.enqueue("a", now - TimeDelta::seconds(5)).await.unwrap();

        let stale = queue.claim_due(now, 1).await.unwrap().remove(0);
        let later = now + TimeDelta::seconds(30);
        let fresh = queue.claim_due(later, 1).await.unwrap().remove(0);
        assert_eq!(fresh.member, "a");

        // The first owner's late restore must not re-queue the entry
        queue.restore(&stale).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.claimed_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let queue = queue();
        queue.enqueue("a", Utc::now()).await.unwrap();
        assert!(queue.remove("a").await.unwrap());
        assert!(!queue.remove("a").await.unwrap());
        assert!(queue.meta("a").await.unwrap().is_none());

        // A claimed member is removed along with its lease
        queue.enqueue("b", Utc::now()).await.unwrap();
        queue.claim_due(Utc::now(), 1).await.unwrap();
        assert!(queue.remove("b").await.unwrap());
        assert_eq!(queue.claimed_len().await.unwrap(), 0);
    }
}
