//! Fixed-window rate limiter over the shared store.
//!
//! Each key gets one counter per window (`ratelimit:{key}:{window}`), where
//! the window index is `floor(now / window)`. Callers past the limit are
//! delayed in proportion to how far over they are. Bursts that straddle a
//! window boundary are accepted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use reelsmith_store::KvStore;
use tracing::{debug, warn};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Window length
    pub window: Duration,
    /// Longest delay applied to a single call
    pub max_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window: std::env::var("RATE_LIMIT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            max_delay: std::env::var("RATE_LIMIT_MAX_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
        }
    }
}

/// Shared-counter rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one call against `key` and sleep if the window is over `limit`.
    ///
    /// Returns the delay that was applied.
    pub async fn rate_limit(&self, key: &str, limit: u32) -> Duration {
        let delay = self.rate_limit_at(key, limit, Utc::now()).await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }

    /// Count one call against `key` at `now` and return the delay it owes.
    ///
    /// Store faults are logged and the call proceeds unthrottled.
    pub async fn rate_limit_at(&self, key: &str, limit: u32, now: DateTime<Utc>) -> Duration {
        let window_ms = self.config.window.as_millis().max(1) as i64;
        let window = now.timestamp_millis().div_euclid(window_ms);
        let counter_key = format!("ratelimit:{}:{}", key, window);

        let count = match self.kv.incr(&counter_key, 1).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key, error = %e, "Rate limit counter unavailable, proceeding");
                return Duration::ZERO;
            }
        };

        if count == 1 {
            if let Err(e) = self.kv.expire(&counter_key, self.config.window * 2).await {
                warn!(key, error = %e, "Failed to set rate limit window expiry");
            }
        }

        let delay = self.delay_for(count, limit);
        if !delay.is_zero() {
            debug!(key, count, limit, delay_ms = delay.as_millis() as u64, "Rate limited");
            counter!("reelsmith_rate_limited_total", "key" => key.to_string()).increment(1);
            histogram!("reelsmith_rate_limit_delay_seconds").record(delay.as_secs_f64());
        }
        delay
    }

    /// Delay owed by the `count`th call in a window allowing `limit`.
    fn delay_for(&self, count: i64, limit: u32) -> Duration {
        let limit = limit.max(1);
        let overage = count - i64::from(limit);
        if overage <= 0 {
            return Duration::ZERO;
        }
        let per_call = self.config.window / limit;
        let overage = u32::try_from(overage).unwrap_or(u32::MAX);
        per_call.saturating_mul(overage).min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use reelsmith_store::{MemoryStore, ScoredMember, StoreError, StoreResult};

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default())
    }

    fn window_start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_040, 0).unwrap()
    }

    #[tokio::test]
    async fn test_exactly_limit_calls_are_not_delayed() {
        let limiter = limiter();
        let now = window_start();
        for _ in 0..5 {
            assert_eq!(limiter.rate_limit_at("tts", 5, now).await, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_call_past_limit_is_delayed() {
        let limiter = limiter();
        let now = window_start();
        for _ in 0..5 {
            limiter.rate_limit_at("tts", 5, now).await;
        }
        // One over: window / limit
        assert_eq!(
            limiter.rate_limit_at("tts", 5, now).await,
            Duration::from_secs(12)
        );
        // Two over
        assert_eq!(
            limiter.rate_limit_at("tts", 5, now).await,
            Duration::from_secs(24)
        );
        // Capped
        assert_eq!(
            limiter.rate_limit_at("tts", 5, now).await,
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_windows_and_keys_are_independent() {
        let limiter = limiter();
        let now = window_start();
        limiter.rate_limit_at("tts", 1, now).await;
        assert!(!limiter.rate_limit_at("tts", 1, now).await.is_zero());

        assert!(limiter.rate_limit_at("images", 1, now).await.is_zero());

        let next_window = now + TimeDelta::seconds(60);
        assert!(limiter.rate_limit_at("tts", 1, next_window).await.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_for_delay() {
        let limiter = limiter();
        limiter.rate_limit("tts", 1).await;

        let start = tokio::time::Instant::now();
        let delay = limiter.rate_limit("tts", 1).await;
        // Both calls can land in different windows if the wall clock rolls over
        assert!(delay.is_zero() || delay == Duration::from_secs(30));
        assert_eq!(start.elapsed(), delay);
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::connection_failed("down"))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> StoreResult<()> {
            Err(StoreError::connection_failed("down"))
        }
        async fn delete(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::connection_failed("down"))
        }
        async fn incr(&self, _: &str, _: i64) -> StoreResult<i64> {
            Err(StoreError::connection_failed("down"))
        }
        async fn expire(&self, _: &str, _: Duration) -> StoreResult<bool> {
            Err(StoreError::connection_failed("down"))
        }
        async fn zadd(&self, _: &str, _: &str, _: f64) -> StoreResult<()> {
            Err(StoreError::connection_failed("down"))
        }
        async fn zrange_by_score(
            &self,
            _: &str,
            _: f64,
            _: f64,
            _: usize,
        ) -> StoreResult<Vec<ScoredMember>> {
            Err(StoreError::connection_failed("down"))
        }
        async fn zrem(&self, _: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::connection_failed("down"))
        }
        async fn zcard(&self, _: &str) -> StoreResult<u64> {
            Err(StoreError::connection_failed("down"))
        }
        async fn zcount(&self, _: &str, _: f64, _: f64) -> StoreResult<u64> {
            Err(StoreError::connection_failed("down"))
        }
        async fn zscore(&self, _: &str, _: &str) -> StoreResult<Option<f64>> {
            Err(StoreError::connection_failed("down"))
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::connection_failed("down"))
        }
    }

    #[tokio::test]
    async fn test_store_fault_proceeds_unthrottled() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), RateLimitConfig::default());
        for _ in 0..3 {
            assert!(limiter.rate_limit_at("tts", 1, window_start()).await.is_zero());
        }
    }
}
