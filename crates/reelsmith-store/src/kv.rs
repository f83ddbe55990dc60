//! The key-value contract shared by every component.
//!
//! All shared mutable state (job records, schedules, queue sets, rate-limit
//! counters) goes through these primitives. Atomicity comes from the store:
//! `incr` is an atomic counter and `zrem` reports whether *this* caller removed
//! the member, which is what makes queue claims exclusive.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// A sorted-set member with its score.
pub type ScoredMember = (String, f64);

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically add `by` to the integer at `key` (missing counts as 0).
    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// Set an expiry on an existing key. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Add or update a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Members with `min <= score <= max`, lowest score first, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<ScoredMember>>;

    /// Remove a member. Returns `true` only for the caller that removed it.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Number of members.
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Number of members with `min <= score <= max`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Score of a member.
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;
}
