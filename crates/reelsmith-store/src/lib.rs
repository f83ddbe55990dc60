//! Durable key-value store for the Reelsmith pipeline.
//!
//! This crate provides:
//! - The [`KvStore`] contract: keyed values with expiry, atomic counters
//!   and sorted sets
//! - A Redis implementation and an in-process implementation
//! - Repositories for job records and publish schedules

pub mod error;
pub mod jobs;
pub mod kv;
pub mod memory;
pub mod metrics;
pub mod redis_store;
pub mod schedules;

pub use error::{StoreError, StoreResult};
pub use jobs::JobRepository;
pub use kv::{KvStore, ScoredMember};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, StoreConfig};
pub use schedules::ScheduleRepository;
