//! Job record repository.
//!
//! One JSON document per job under `job:{id}`. A save writes the whole
//! record in a single `set`, so a stage advance and its artifact land
//! together or not at all.

use std::sync::Arc;

use reelsmith_models::{JobId, JobRecord};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::kv::KvStore;

/// Repository for [`JobRecord`]s.
#[derive(Clone)]
pub struct JobRepository {
    kv: Arc<dyn KvStore>,
}

impl JobRepository {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &JobId) -> String {
        format!("job:{}", id)
    }

    /// Insert a new record. Fails if the id is taken.
    pub async fn create(&self, record: &JobRecord) -> StoreResult<()> {
        let key = Self::key(&record.id);
        if self.kv.get(&key).await?.is_some() {
            return Err(StoreError::AlreadyExists(key));
        }
        let payload = serde_json::to_string(record)?;
        self.kv.set(&key, &payload, None).await?;
        debug!(job_id = %record.id, "Created job record");
        Ok(())
    }

    pub async fn get(&self, id: &JobId) -> StoreResult<Option<JobRecord>> {
        match self.kv.get(&Self::key(id)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Get a record or fail with `NotFound`.
    pub async fn require(&self, id: &JobId) -> StoreResult<JobRecord> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found(Self::key(id)))
    }

    /// Persist the record as one write.
    pub async fn save(&self, record: &JobRecord) -> StoreResult<()> {
        let payload = serde_json::to_string(record)?;
        self.kv.set(&Self::key(&record.id), &payload, None).await?;
        debug!(job_id = %record.id, stage = %record.stage, "Saved job record");
        Ok(())
    }

    pub async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        self.kv.delete(&Self::key(id)).await
    }
}
