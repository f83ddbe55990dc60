//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use reelsmith_queue::{BackoffPolicy, BatchConfig, RateLimitConfig, DEFAULT_CLAIM_LEASE};

use crate::retry::RetryConfig;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// External resource a rate limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Script generation (LLM)
    Llm,
    /// Text to speech
    Tts,
    /// Image generation
    Images,
    /// Video assembly and thumbnails
    Render,
    /// Platform uploads
    Publish,
}

impl Provider {
    /// Rate limiter key.
    pub fn key(&self) -> &'static str {
        match self {
            Provider::Llm => "llm",
            Provider::Tts => "tts",
            Provider::Images => "images",
            Provider::Render => "render",
            Provider::Publish => "publish",
        }
    }
}

/// Calls allowed per rate-limit window, per provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
    pub llm: u32,
    pub tts: u32,
    pub images: u32,
    pub render: u32,
    pub publish: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            llm: 20,
            tts: 30,
            images: 20,
            render: 10,
            publish: 6,
        }
    }
}

impl ProviderLimits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            llm: env_or("RATE_LIMIT_LLM", d.llm),
            tts: env_or("RATE_LIMIT_TTS", d.tts),
            images: env_or("RATE_LIMIT_IMAGES", d.images),
            render: env_or("RATE_LIMIT_RENDER", d.render),
            publish: env_or("RATE_LIMIT_PUBLISH", d.publish),
        }
    }

    pub fn limit_for(&self, provider: Provider) -> u32 {
        match provider {
            Provider::Llm => self.llm,
            Provider::Tts => self.tts,
            Provider::Images => self.images,
            Provider::Render => self.render,
            Provider::Publish => self.publish,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Entries claimed per trigger
    pub batch_size: usize,
    /// Upper bound on one trigger's processing time
    pub max_processing_time: Duration,
    /// Hard timeout of the hosting invocation
    pub invocation_timeout: Duration,
    /// Headroom kept below the invocation timeout
    pub safety_buffer: Duration,
    /// Period of the trigger loop in the worker binary
    pub trigger_interval: Duration,
    /// Executor attempts per stage
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter: bool,
    /// Queue requeues before dead-lettering
    pub publish_max_retries: u32,
    pub recovery_max_retries: u32,
    /// Base of the queue requeue backoff
    pub queue_backoff_base: Duration,
    /// How long a claimed queue entry stays leased to its trigger
    pub claim_lease: Duration,
    pub rate_limit: RateLimitConfig,
    pub provider_limits: ProviderLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_processing_time: Duration::from_secs(50),
            invocation_timeout: Duration::from_secs(60),
            safety_buffer: Duration::from_secs(10),
            trigger_interval: Duration::from_secs(60),
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_jitter: false,
            publish_max_retries: 5,
            recovery_max_retries: 5,
            queue_backoff_base: Duration::from_secs(60),
            claim_lease: DEFAULT_CLAIM_LEASE,
            rate_limit: RateLimitConfig::default(),
            provider_limits: ProviderLimits::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            batch_size: env_or("TRIGGER_BATCH_SIZE", d.batch_size),
            max_processing_time: Duration::from_secs(env_or(
                "MAX_PROCESSING_TIME_SECS",
                d.max_processing_time.as_secs(),
            )),
            invocation_timeout: Duration::from_secs(env_or(
                "INVOCATION_TIMEOUT_SECS",
                d.invocation_timeout.as_secs(),
            )),
            safety_buffer: Duration::from_secs(env_or(
                "SAFETY_BUFFER_SECS",
                d.safety_buffer.as_secs(),
            )),
            trigger_interval: Duration::from_secs(env_or(
                "TRIGGER_INTERVAL_SECS",
                d.trigger_interval.as_secs(),
            )),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", d.retry_max_attempts),
            retry_initial_delay: Duration::from_millis(env_or(
                "RETRY_INITIAL_DELAY_MS",
                d.retry_initial_delay.as_millis() as u64,
            )),
            retry_max_delay: Duration::from_millis(env_or(
                "RETRY_MAX_DELAY_MS",
                d.retry_max_delay.as_millis() as u64,
            )),
            retry_jitter: env_or("RETRY_JITTER", d.retry_jitter),
            publish_max_retries: env_or("PUBLISH_MAX_RETRIES", d.publish_max_retries),
            recovery_max_retries: env_or("RECOVERY_MAX_RETRIES", d.recovery_max_retries),
            queue_backoff_base: Duration::from_secs(env_or(
                "QUEUE_BACKOFF_BASE_SECS",
                d.queue_backoff_base.as_secs(),
            )),
            claim_lease: Duration::from_secs(env_or(
                "CLAIM_LEASE_SECS",
                d.claim_lease.as_secs(),
            )),
            rate_limit: RateLimitConfig::from_env(),
            provider_limits: ProviderLimits::from_env(),
        }
    }

    /// Wall-clock budget for one trigger.
    pub fn budget(&self) -> Duration {
        self.max_processing_time
            .min(self.invocation_timeout.saturating_sub(self.safety_buffer))
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.batch_size,
            max_processing_time: self.budget(),
        }
    }

    pub fn publish_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.publish_max_retries, self.queue_backoff_base)
    }

    pub fn recovery_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.recovery_max_retries, self.queue_backoff_base)
    }

    /// Retry executor settings for one operation.
    pub fn retry_config(&self, operation_name: impl Into<String>) -> RetryConfig {
        RetryConfig::new(operation_name)
            .with_max_attempts(self.retry_max_attempts)
            .with_initial_delay(self.retry_initial_delay)
            .with_max_delay(self.retry_max_delay)
            .with_jitter(self.retry_jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_keeps_safety_buffer() {
        let config = WorkerConfig::default();
        assert_eq!(config.budget(), Duration::from_secs(50));

        let tight = WorkerConfig {
            max_processing_time: Duration::from_secs(300),
            invocation_timeout: Duration::from_secs(60),
            safety_buffer: Duration::from_secs(15),
            ..WorkerConfig::default()
        };
        assert_eq!(tight.budget(), Duration::from_secs(45));

        let degenerate = WorkerConfig {
            invocation_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        };
        assert_eq!(degenerate.budget(), Duration::ZERO);
    }

    #[test]
    fn test_provider_limits() {
        let limits = ProviderLimits::default();
        assert_eq!(limits.limit_for(Provider::Publish), 6);
        assert_eq!(Provider::Tts.key(), "tts");
    }
}
