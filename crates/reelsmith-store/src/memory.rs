//! In-process [`KvStore`].
//!
//! Used for tests and single-process deployments. Expiry runs on the tokio
//! clock, so tests with paused time see keys expire deterministically.
//! Expired keys are dropped when read and by a sweep that runs on writes at
//! most once per [`SWEEP_INTERVAL`], so short-lived counters never pile up.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::kv::{KvStore, ScoredMember};

/// Minimum time between two expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct State {
    values: HashMap<String, Entry>,
    sets: HashMap<String, HashMap<String, f64>>,
    last_sweep: Instant,
}

impl Default for State {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            sets: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }
}

impl State {
    /// Drop every expired value once the sweep interval has passed.
    fn sweep(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        let before = self.values.len();
        self.values.retain(|_, entry| entry.is_live(now));
        let dropped = before - self.values.len();
        if dropped > 0 {
            debug!(dropped, "Swept expired keys");
        }
    }

    /// Live value entry, dropping it if expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|e| !e.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value keys currently held, expired ones not yet swept included.
    pub async fn value_count(&self) -> usize {
        self.state.lock().await.values.len()
    }
}

fn in_range(score: f64, min: f64, max: f64) -> bool {
    score >= min && score <= max
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.live(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.sweep();
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let had_value = state.live(key).is_some();
        state.values.remove(key);
        let had_set = state.sets.remove(key).is_some();
        Ok(had_value || had_set)
    }

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        state.sweep();
        match state.live(key) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current + by;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                state.values.insert(
                    key.to_string(),
                    Entry {
                        value: by.to_string(),
                        expires_at: None,
                    },
                );
                Ok(by)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        let state = self.state.lock().await;
        let Some(set) = state.sets.get(key) else {
            return Ok(Vec::new());
        };

        let mut members: Vec<ScoredMember> = set
            .iter()
            .filter(|(_, score)| in_range(**score, min, max))
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        // Redis orders equal scores lexicographically by member
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members.truncate(limit);
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(set) = state.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            state.sets.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).map_or(0, |set| {
            set.values().filter(|score| in_range(**score, min, max)).count() as u64
        }))
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_keeps_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c", 1).await.unwrap(), 1);
        assert!(store.expire("c", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.incr("c", 1).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.incr("c", 1).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_counters_are_swept_on_write() {
        let store = MemoryStore::new();
        for window in 0..50 {
            let key = format!("ratelimit:llm:{window}");
            store.incr(&key, 1).await.unwrap();
            store.expire(&key, Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(store.value_count().await, 50);

        // Nobody reads the old windows again
        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        store.incr("ratelimit:llm:fresh", 1).await.unwrap();
        assert_eq!(store.value_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_keys() {
        let store = MemoryStore::new();
        store.set("forever", "1", None).await.unwrap();
        store
            .set("long", "1", Some(SWEEP_INTERVAL * 3))
            .await
            .unwrap();
        store
            .set("short", "1", Some(Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        store.set("other", "1", None).await.unwrap();
        assert_eq!(store.value_count().await, 3);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set("k", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("k", 1).await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_sorted_set_range_and_claim() {
        let store = MemoryStore::new();
        store.zadd("q", "b", 20.0).await.unwrap();
        store.zadd("q", "a", 10.0).await.unwrap();
        store.zadd("q", "c", 30.0).await.unwrap();

        let due = store
            .zrange_by_score("q", f64::NEG_INFINITY, 25.0, 10)
            .await
            .unwrap();
        assert_eq!(due, vec![("a".to_string(), 10.0), ("b".to_string(), 20.0)]);
        assert_eq!(store.zcount("q", f64::NEG_INFINITY, 25.0).await.unwrap(), 2);

        // Only the first remover wins
        assert!(store.zrem("q", "a").await.unwrap());
        assert!(!store.zrem("q", "a").await.unwrap());
        assert_eq!(store.zcard("q").await.unwrap(), 2);
        assert_eq!(store.zscore("q", "c").await.unwrap(), Some(30.0));
    }

    #[tokio::test]
    async fn test_range_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.zadd("q", &format!("m{i}"), i as f64).await.unwrap();
        }
        let first_two = store.zrange_by_score("q", 0.0, 100.0, 2).await.unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].0, "m0");
    }
}
