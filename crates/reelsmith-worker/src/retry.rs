//! Retry executor with exponential backoff.
//!
//! Wraps one fallible unit of work against a flaky external service. Only
//! transient errors are retried; anything else comes back at once, tagged
//! with the operation name.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Randomize each delay within its upper half.
    pub jitter: bool,
    /// Operation name for logging and error context.
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the given operation name.
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the failed attempt with the given zero-based index.
    fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt_index))
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let max_ms = delay.as_millis() as u64;
            let ms = rand::rng().random_range(max_ms / 2..=max_ms);
            Duration::from_millis(ms)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// attempts.
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new("narration").with_max_attempts(3);
/// let audio = with_retry(&config, || studio.generate_narration(&script, None)).await?;
/// ```
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> WorkerResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = WorkerResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = %config.operation_name,
                        attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) => e,
        };
        attempt += 1;

        if !error.is_retryable() {
            return Err(error.with_context(config.operation_name.clone()));
        }

        if attempt >= max_attempts {
            warn!(
                operation = %config.operation_name,
                attempts = attempt,
                error = %error,
                "Retries exhausted"
            );
            metrics::record_retries_exhausted(&config.operation_name);
            return Err(WorkerError::ExhaustedRetries {
                context: config.operation_name.clone(),
                attempts: attempt,
                source: Box::new(error),
            });
        }

        let delay = config.delay_for_attempt(attempt - 1);
        debug!(
            operation = %config.operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        metrics::record_retry(&config.operation_name);
        tokio::time::sleep(delay).await;
    }
}

/// State tracker for repeated operations that may fail intermittently.
///
/// Used by the periodic trigger loop to suppress log spam while the store or
/// a provider is down.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    /// Record a successful operation (resets failure count).
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 && self.suppressed {
            debug!(
                "Operation recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Record a failed operation.
    ///
    /// Returns `true` if this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else if self.consecutive_failures == self.max_logged_failures + 1 {
            self.suppressed = true;
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
            false
        } else {
            false
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
