//! Redis-backed [`KvStore`].

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::kv::{KvStore, ScoredMember};
use crate::metrics::record_command;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix prepended to every key
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "reelsmith:".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("STORE_KEY_PREFIX")
                .unwrap_or_else(|_| "reelsmith:".to_string()),
        }
    }
}

/// Redis client implementing the store contract.
pub struct RedisStore {
    client: redis::Client,
    config: StoreConfig,
}

impl RedisStore {
    /// Create a new store.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        info!("Redis store configured with key prefix '{}'", config.key_prefix);
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run one command on a fresh multiplexed connection, recording metrics.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let start = Instant::now();
        let conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                record_command(op, false, start.elapsed().as_secs_f64());
                return Err(e.into());
            }
        };

        let result = f(conn).await;
        record_command(op, result.is_ok(), start.elapsed().as_secs_f64());
        Ok(result?)
    }
}

/// Redis score syntax, including the infinities.
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.key(key);
        self.run("get", |mut conn| async move { conn.get(&key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let key = self.key(key);
        self.run("set", |mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd.query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = self.key(key);
        let removed: u64 = self
            .run("del", |mut conn| async move { conn.del(&key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
        let key = self.key(key);
        self.run("incr", |mut conn| async move { conn.incr(&key, by).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let key = self.key(key);
        let applied: i64 = self
            .run("pexpire", |mut conn| async move {
                redis::cmd("PEXPIRE")
                    .arg(&key)
                    .arg(millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(applied == 1)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let key = self.key(key);
        self.run("zadd", |mut conn| async move {
            conn.zadd::<_, _, _, ()>(&key, member, score).await
        })
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<ScoredMember>> {
        let key = self.key(key);
        let members: Vec<ScoredMember> = self
            .run("zrangebyscore", |mut conn| async move {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg(score_arg(min))
                    .arg(score_arg(max))
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        debug!("ZRANGEBYSCORE returned {} members", members.len());
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let key = self.key(key);
        let removed: u64 = self
            .run("zrem", |mut conn| async move { conn.zrem(&key, member).await })
            .await?;
        Ok(removed == 1)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let key = self.key(key);
        self.run("zcard", |mut conn| async move { conn.zcard(&key).await })
            .await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let key = self.key(key);
        self.run("zcount", |mut conn| async move {
            redis::cmd("ZCOUNT")
                .arg(&key)
                .arg(score_arg(min))
                .arg(score_arg(max))
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let key = self.key(key);
        self.run("zscore", |mut conn| async move { conn.zscore(&key, member).await })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run("ping", |mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg_infinities() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(1700000000000.0), "1700000000000");
    }

    #[test]
    fn test_key_prefix() {
        let store = RedisStore::new(StoreConfig {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "test:".to_string(),
        })
        .unwrap();
        assert_eq!(store.key("job:1"), "test:job:1");
    }

    #[test]
    fn test_sub_millisecond_ttl_rounds_up() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
