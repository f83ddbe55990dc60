//! Queues and flow control for the Reelsmith pipeline.
//!
//! This crate provides:
//! - A fixed-window rate limiter over the shared store
//! - Time-ordered durable queues with atomic claim, backoff and dead-lettering
//! - The publishing and recovery queues built on them
//! - A single-flight, budget-bounded batch processor

pub mod backoff;
pub mod batch;
pub mod error;
pub mod publishing;
pub mod rate_limit;
pub mod recovery;
pub mod scheduled;

pub use backoff::{BackoffPolicy, FailureDecision};
pub use batch::{BatchConfig, BatchGuard, BatchHandler, BatchProcessor, BatchReport};
pub use error::{QueueError, QueueResult};
pub use publishing::{PublishingQueue, MAX_PUBLISH_RETRIES, PUBLISHING_QUEUE};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use recovery::{RecoveryQueue, RECOVERY_MAX_AGE_HOURS, RECOVERY_QUEUE};
pub use scheduled::{ClaimedEntry, EntryMeta, QueueStats, ScheduledQueue, DEFAULT_CLAIM_LEASE};
