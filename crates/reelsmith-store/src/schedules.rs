//! Publish schedule repository.

use std::sync::Arc;

use reelsmith_models::{PublishSchedule, ScheduleId};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::kv::KvStore;

/// Repository for [`PublishSchedule`]s, stored as JSON under `schedule:{id}`.
#[derive(Clone)]
pub struct ScheduleRepository {
    kv: Arc<dyn KvStore>,
}

impl ScheduleRepository {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &ScheduleId) -> String {
        format!("schedule:{}", id)
    }

    pub async fn get(&self, id: &ScheduleId) -> StoreResult<Option<PublishSchedule>> {
        match self.kv.get(&Self::key(id)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, id: &ScheduleId) -> StoreResult<PublishSchedule> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found(Self::key(id)))
    }

    pub async fn save(&self, schedule: &PublishSchedule) -> StoreResult<()> {
        let payload = serde_json::to_string(schedule)?;
        self.kv.set(&Self::key(&schedule.id), &payload, None).await?;
        debug!(
            schedule_id = %schedule.id,
            status = %schedule.status,
            "Saved publish schedule"
        );
        Ok(())
    }

    pub async fn delete(&self, id: &ScheduleId) -> StoreResult<bool> {
        self.kv.delete(&Self::key(id)).await
    }
}
