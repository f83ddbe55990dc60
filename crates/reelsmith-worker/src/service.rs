//! Pipeline service: submission, schedules and the two queue triggers.
//!
//! The triggers are what the periodic scheduler (cron endpoint or the worker
//! binary) calls. Each one claims due entries from its queue, runs them
//! through a single-flight batch under the wall-clock budget, settles every
//! entry (complete, requeue with backoff, expire or dead-letter) and returns
//! a [`TriggerSummary`]. Overlapping calls are safe: in-process ones are
//! refused by the batch guard and cross-process ones never see each other's
//! claimed entries. Claims are leased, so entries held by a trigger that was
//! killed come back to the queue once the lease runs out. Entries a cancelled
//! trigger never started are handed back by the next trigger straight away.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelsmith_models::{
    EntryOutcome, EntryReport, JobId, JobInputs, JobRecord, PublishMetadata, PublishSchedule,
    ScheduleId, ScheduleStatus, Severity, TriggerSummary,
};
use reelsmith_queue::{
    BatchGuard, BatchHandler, BatchProcessor, BatchReport, ClaimedEntry, PublishingQueue,
    QueueStats, RateLimiter, RecoveryQueue, ScheduledQueue, PUBLISHING_QUEUE, RECOVERY_QUEUE,
};
use reelsmith_store::{JobRepository, KvStore, ScheduleRepository};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::orchestrator::PipelineOrchestrator;
use crate::studio::{ContentStudio, Notifier, Publisher};

/// Sizes of both queues.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub publishing: QueueStats,
    pub recovery: QueueStats,
}

/// External collaborators the service drives.
#[derive(Clone)]
pub struct Collaborators {
    pub studio: Arc<dyn ContentStudio>,
    pub publisher: Arc<dyn Publisher>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct PipelineService {
    kv: Arc<dyn KvStore>,
    orchestrator: PipelineOrchestrator,
    jobs: JobRepository,
    schedules: ScheduleRepository,
    publishing: PublishingQueue,
    recovery: RecoveryQueue,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
    publish_batch: BatchProcessor<ClaimedEntry>,
    recovery_batch: BatchProcessor<ClaimedEntry>,
}

impl PipelineService {
    pub fn new(kv: Arc<dyn KvStore>, collaborators: Collaborators, config: WorkerConfig) -> Self {
        let jobs = JobRepository::new(kv.clone());
        let schedules = ScheduleRepository::new(kv.clone());
        let limiter = RateLimiter::new(kv.clone(), config.rate_limit);
        let orchestrator = PipelineOrchestrator::new(
            jobs.clone(),
            schedules.clone(),
            collaborators.studio,
            collaborators.publisher,
            limiter,
            config.clone(),
        );

        Self {
            publishing: PublishingQueue::with_policy(kv.clone(), config.publish_policy())
                .with_lease(config.claim_lease),
            recovery: RecoveryQueue::with_policy(kv.clone(), config.recovery_policy())
                .with_lease(config.claim_lease),
            publish_batch: BatchProcessor::new(config.batch_config()),
            recovery_batch: BatchProcessor::new(config.batch_config()),
            kv,
            orchestrator,
            jobs,
            schedules,
            notifier: collaborators.notifier,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn publishing_queue(&self) -> &PublishingQueue {
        &self.publishing
    }

    pub fn recovery_queue(&self) -> &RecoveryQueue {
        &self.recovery
    }

    /// Store connectivity check.
    pub async fn ping(&self) -> WorkerResult<()> {
        Ok(self.kv.ping().await?)
    }

    /// Validate inputs, create the job record and queue its first run.
    pub async fn submit(&self, inputs: JobInputs) -> WorkerResult<JobRecord> {
        inputs.check()?;
        let record = JobRecord::new(inputs);
        self.jobs.create(&record).await?;
        self.recovery.enqueue(&record.id).await?;

        metrics::record_job_submitted();
        info!(
            job_id = %record.id,
            channel_id = %record.inputs.channel_id,
            "Job submitted"
        );
        Ok(record)
    }

    pub async fn get_job(&self, job_id: &JobId) -> WorkerResult<JobRecord> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| WorkerError::JobNotFound(job_id.to_string()))
    }

    /// Reopen a failed job and queue it for a fresh run.
    pub async fn reopen(&self, job_id: &JobId) -> WorkerResult<JobRecord> {
        let record = self.orchestrator.reopen(job_id).await?;
        // Drop dead-lettered state so the new run starts with a clean retry count
        self.recovery.remove(job_id).await?;
        self.recovery.enqueue(job_id).await?;
        Ok(record)
    }

    pub async fn get_schedule(&self, id: &ScheduleId) -> WorkerResult<PublishSchedule> {
        self.schedules
            .get(id)
            .await?
            .ok_or_else(|| WorkerError::ScheduleNotFound(id.to_string()))
    }

    /// Schedule publication of a job. Idempotent per job.
    ///
    /// A pending schedule is moved to the new time; a published one is
    /// returned untouched; a failed or cancelled one starts over.
    pub async fn schedule_publish(
        &self,
        job_id: &JobId,
        publish_at: DateTime<Utc>,
        metadata: Option<PublishMetadata>,
    ) -> WorkerResult<PublishSchedule> {
        let record = self.get_job(job_id).await?;
        if record.is_failed() {
            return Err(WorkerError::conflict(format!(
                "job {} has failed and cannot be scheduled",
                job_id
            )));
        }

        let id = ScheduleId::for_job(job_id);
        let metadata = metadata.unwrap_or_else(|| PublishMetadata::from_inputs(&record.inputs));

        let schedule = match self.schedules.get(&id).await? {
            Some(existing) if existing.status == ScheduleStatus::Published => return Ok(existing),
            Some(mut existing) if existing.status == ScheduleStatus::Scheduled => {
                existing.publish_at = publish_at;
                existing.metadata = metadata;
                existing.updated_at = Utc::now();
                existing
            }
            _ => {
                self.publishing.cancel(&id).await?;
                PublishSchedule::new(
                    job_id.clone(),
                    record.inputs.channel_id.clone(),
                    publish_at,
                    metadata,
                )
            }
        };

        self.schedules.save(&schedule).await?;
        self.publishing.schedule(&id, publish_at).await?;
        info!(
            schedule_id = %id,
            job_id = %job_id,
            publish_at = %publish_at,
            "Publish scheduled"
        );
        Ok(schedule)
    }

    /// Cancel a pending schedule. Cancelling twice is a no-op.
    pub async fn cancel_schedule(&self, id: &ScheduleId) -> WorkerResult<PublishSchedule> {
        let mut schedule = self.get_schedule(id).await?;
        match schedule.status {
            ScheduleStatus::Scheduled => {
                schedule.cancel();
                self.schedules.save(&schedule).await?;
                self.publishing.cancel(id).await?;
                info!(schedule_id = %id, "Publish schedule cancelled");
                Ok(schedule)
            }
            ScheduleStatus::Cancelled => Ok(schedule),
            status => Err(WorkerError::conflict(format!(
                "schedule {} is {} and cannot be cancelled",
                id, status
            ))),
        }
    }

    pub async fn queue_status(&self, now: DateTime<Utc>) -> WorkerResult<QueueStatus> {
        Ok(QueueStatus {
            publishing: self.publishing.stats(now).await?,
            recovery: self.recovery.stats(now).await?,
        })
    }

    /// Publish every schedule whose time has come, within the budget.
    pub async fn run_due_publishing(&self, now: DateTime<Utc>) -> WorkerResult<TriggerSummary> {
        let started = Instant::now();
        let guard = self.publish_batch.begin()?;
        self.restore_abandoned(&guard, self.publishing.queue()).await;

        let claimed = self.publishing.claim_due(now, self.config.batch_size).await?;
        for entry in claimed {
            guard.push(entry, 0).await;
        }

        let handler = PublishHandler {
            service: self,
            now,
            summary: Mutex::new(TriggerSummary::new(PUBLISHING_QUEUE)),
        };
        let report = guard.run_from(&handler, started).await;
        let summary = handler.summary.into_inner();

        self.finish_trigger(guard, self.publishing.queue(), summary, report, now, started)
            .await
    }

    /// Run every pending or interrupted job, within the budget.
    pub async fn run_due_recovery(&self, now: DateTime<Utc>) -> WorkerResult<TriggerSummary> {
        let started = Instant::now();
        let guard = self.recovery_batch.begin()?;
        self.restore_abandoned(&guard, self.recovery.queue()).await;

        let claimed = self.recovery.claim_due(now, self.config.batch_size).await?;
        for entry in claimed {
            let priority = self.job_priority(&entry.member).await;
            guard.push(entry, priority).await;
        }

        let handler = RecoveryHandler {
            service: self,
            now,
            summary: Mutex::new(TriggerSummary::new(RECOVERY_QUEUE)),
        };
        let report = guard.run_from(&handler, started).await;
        let summary = handler.summary.into_inner();

        self.finish_trigger(guard, self.recovery.queue(), summary, report, now, started)
            .await
    }

    /// Hand back entries a cancelled trigger claimed but never started.
    async fn restore_abandoned(&self, guard: &BatchGuard<'_, ClaimedEntry>, queue: &ScheduledQueue) {
        let abandoned = guard.drain().await;
        if abandoned.is_empty() {
            return;
        }
        warn!(
            queue = queue.name(),
            count = abandoned.len(),
            "Restoring entries left by an interrupted trigger"
        );
        for entry in abandoned {
            if let Err(e) = queue.restore(&entry).await {
                error!(queue = queue.name(), member = %entry.member, error = %e, "Failed to restore abandoned entry");
            }
        }
    }

    async fn job_priority(&self, member: &str) -> i32 {
        match self.jobs.get(&JobId::from_string(member)).await {
            Ok(Some(record)) => record.inputs.priority,
            _ => 0,
        }
    }

    /// Restore whatever the budget left unprocessed and build the summary.
    async fn finish_trigger(
        &self,
        guard: BatchGuard<'_, ClaimedEntry>,
        queue: &ScheduledQueue,
        mut summary: TriggerSummary,
        report: BatchReport,
        now: DateTime<Utc>,
        started: Instant,
    ) -> WorkerResult<TriggerSummary> {
        let budget = WorkerError::BudgetExhausted(format!(
            "{}s spent",
            self.config.budget().as_secs()
        ));
        for entry in guard.drain().await {
            if let Err(e) = queue.restore(&entry).await {
                error!(queue = queue.name(), member = %entry.member, error = %e, "Failed to restore deferred entry");
            }
            metrics::record_trigger_entry(queue.name(), "deferred");
            summary.push(EntryReport::new(
                entry.member,
                EntryOutcome::Deferred {
                    reason: budget.to_string(),
                },
            ));
        }
        drop(guard);

        summary.budget_exhausted = report.budget_exhausted;
        let stats = queue.stats(now).await?;
        summary.remaining_count = stats.total;
        metrics::set_queue_lengths(queue.name(), stats.total, stats.dead_lettered);

        let elapsed = started.elapsed();
        metrics::record_trigger(queue.name(), summary.budget_exhausted, elapsed.as_secs_f64());
        info!(
            queue = queue.name(),
            processed = summary.processed_count,
            remaining = summary.remaining_count,
            budget_exhausted = summary.budget_exhausted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Trigger finished"
        );
        Ok(summary)
    }

    async fn publish_entry(&self, entry: &ClaimedEntry, now: DateTime<Utc>) -> WorkerResult<EntryOutcome> {
        let id = ScheduleId::from_string(entry.member.as_str());
        match self.orchestrator.publish_job(&id).await {
            Ok(url) => Ok(self.publishing.succeed(entry, &url).await?),
            Err(e) => self.publish_failed(entry, &id, e, now).await,
        }
    }

    async fn publish_failed(
        &self,
        entry: &ClaimedEntry,
        id: &ScheduleId,
        err: WorkerError,
        now: DateTime<Utc>,
    ) -> WorkerResult<EntryOutcome> {
        let message = err.to_string();
        let outcome = self
            .publishing
            .fail(entry.clone(), &message, err.is_permanent(), now)
            .await?;
        let gave_up = matches!(outcome, EntryOutcome::DeadLettered { .. });

        match self.schedules.get(id).await {
            Ok(Some(mut schedule)) if schedule.status == ScheduleStatus::Scheduled => {
                schedule.record_failure(message.as_str());
                if gave_up {
                    schedule.mark_failed(message.as_str());
                }
                if let Err(e) = self.schedules.save(&schedule).await {
                    warn!(schedule_id = %id, error = %e, "Failed to record publish failure");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(schedule_id = %id, error = %e, "Failed to load schedule"),
        }

        if let EntryOutcome::DeadLettered { retry_count, .. } = &outcome {
            self.notifier
                .notify(
                    Severity::Error,
                    &format!(
                        "Publishing {} abandoned after {} attempts: {}",
                        id, retry_count, message
                    ),
                )
                .await;
        }
        Ok(outcome)
    }

    async fn recover_entry(&self, entry: &ClaimedEntry, now: DateTime<Utc>) -> WorkerResult<EntryOutcome> {
        if self.recovery.is_expired(entry, now) {
            return Ok(self.recovery.expire(entry).await?);
        }

        let job_id = JobId::from_string(entry.member.as_str());
        let result = match self.orchestrator.run_job(&job_id).await {
            Ok(record) => self.after_production(&record).await.map(|_| record),
            Err(e) => Err(e),
        };

        match result {
            Ok(record) => Ok(self
                .recovery
                .succeed(entry, Some(record.stage.to_string()))
                .await?),
            Err(e) => {
                let message = e.to_string();
                let outcome = self
                    .recovery
                    .fail(entry.clone(), &message, e.is_permanent(), now)
                    .await?;

                if let EntryOutcome::DeadLettered { retry_count, .. } = &outcome {
                    if let Err(mark_err) = self.orchestrator.mark_failed(&job_id, &message).await {
                        warn!(job_id = %job_id, error = %mark_err, "Failed to mark job failed");
                    }
                    self.notifier
                        .notify(
                            Severity::Error,
                            &format!(
                                "Job {} failed after {} runs: {}",
                                job_id, retry_count, message
                            ),
                        )
                        .await;
                }
                Ok(outcome)
            }
        }
    }

    /// Queue publication for a produced job that asked for it at submission.
    async fn after_production(&self, record: &JobRecord) -> WorkerResult<()> {
        let Some(publish_at) = record.inputs.publish_at else {
            return Ok(());
        };
        if !record.stage.is_produced() {
            return Ok(());
        }

        let id = ScheduleId::for_job(&record.id);
        let schedule = match self.schedules.get(&id).await? {
            Some(existing) => existing,
            None => {
                let schedule = PublishSchedule::new(
                    record.id.clone(),
                    record.inputs.channel_id.clone(),
                    publish_at,
                    PublishMetadata::from_inputs(&record.inputs),
                );
                self.schedules.save(&schedule).await?;
                schedule
            }
        };

        if schedule.status == ScheduleStatus::Scheduled
            && self.publishing.queue().due_at(id.as_str()).await?.is_none()
        {
            self.publishing.schedule(&id, schedule.publish_at).await?;
            info!(schedule_id = %id, publish_at = %schedule.publish_at, "Publish scheduled on completion");
        }
        Ok(())
    }

    async fn settle_error(&self, queue: &ScheduledQueue, entry: &ClaimedEntry, err: &WorkerError) {
        error!(
            queue = queue.name(),
            member = %entry.member,
            error = %err,
            "Failed to settle queue entry, restoring it"
        );
        if let Err(e) = queue.restore(entry).await {
            error!(queue = queue.name(), member = %entry.member, error = %e, "Failed to restore entry");
        }
    }
}

struct PublishHandler<'a> {
    service: &'a PipelineService,
    now: DateTime<Utc>,
    summary: Mutex<TriggerSummary>,
}

#[async_trait]
impl<'a> BatchHandler<ClaimedEntry> for PublishHandler<'a> {
    type Output = EntryOutcome;
    type Error = WorkerError;

    async fn handle(&self, entry: &ClaimedEntry) -> WorkerResult<EntryOutcome> {
        self.service.publish_entry(entry, self.now).await
    }

    async fn on_success(&self, entry: &ClaimedEntry, outcome: EntryOutcome) {
        metrics::record_trigger_entry(PUBLISHING_QUEUE, outcome.as_str());
        self.summary
            .lock()
            .await
            .push(EntryReport::new(entry.member.clone(), outcome));
    }

    async fn on_error(&self, entry: &ClaimedEntry, err: &WorkerError) {
        self.service
            .settle_error(self.service.publishing.queue(), entry, err)
            .await;
        metrics::record_trigger_entry(PUBLISHING_QUEUE, "deferred");
        self.summary
            .lock()
            .await
            .push(EntryReport::new(
                entry.member.clone(),
                EntryOutcome::Deferred {
                    reason: err.to_string(),
                },
            ));
    }
}

struct RecoveryHandler<'a> {
    service: &'a PipelineService,
    now: DateTime<Utc>,
    summary: Mutex<TriggerSummary>,
}

#[async_trait]
impl<'a> BatchHandler<ClaimedEntry> for RecoveryHandler<'a> {
    type Output = EntryOutcome;
    type Error = WorkerError;

    async fn handle(&self, entry: &ClaimedEntry) -> WorkerResult<EntryOutcome> {
        self.service.recover_entry(entry, self.now).await
    }

    async fn on_success(&self, entry: &ClaimedEntry, outcome: EntryOutcome) {
        metrics::record_trigger_entry(RECOVERY_QUEUE, outcome.as_str());
        self.summary
            .lock()
            .await
            .push(EntryReport::new(entry.member.clone(), outcome));
    }

    async fn on_error(&self, entry: &ClaimedEntry, err: &WorkerError) {
        self.service
            .settle_error(self.service.recovery.queue(), entry, err)
            .await;
        metrics::record_trigger_entry(RECOVERY_QUEUE, "deferred");
        self.summary
            .lock()
            .await
            .push(EntryReport::new(
                entry.member.clone(),
                EntryOutcome::Deferred {
                    reason: err.to_string(),
                },
            ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderLimits;
    use crate::testing::{RecordingNotifier, ScriptedStudio};
    use chrono::TimeDelta;
    use reelsmith_models::{PipelineStep, Stage, StepOutput};
    use reelsmith_store::MemoryStore;
    use std::time::Duration;

    struct Harness {
        service: PipelineService,
        studio: Arc<ScriptedStudio>,
        notifier: Arc<RecordingNotifier>,
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            provider_limits: ProviderLimits {
                llm: 1000,
                tts: 1000,
                images: 1000,
                render: 1000,
                publish: 1000,
            },
            ..WorkerConfig::default()
        }
    }

    fn harness_with(studio: ScriptedStudio, config: WorkerConfig) -> Harness {
        let kv = Arc::new(MemoryStore::new());
        let studio = Arc::new(studio);
        let notifier = Arc::new(RecordingNotifier::new());
        let service = PipelineService::new(
            kv,
            Collaborators {
                studio: studio.clone(),
                publisher: studio.clone(),
                notifier: notifier.clone(),
            },
            config,
        );
        Harness {
            service,
            studio,
            notifier,
        }
    }

    fn harness(studio: ScriptedStudio) -> Harness {
        harness_with(studio, test_config())
    }

    fn inputs() -> JobInputs {
        JobInputs::new("Octopus intelligence", "chan-1")
    }

    async fn produced_job(h: &Harness) -> JobRecord {
        let job = h.service.submit(inputs()).await.unwrap();
        let summary = h.service.run_due_recovery(Utc::now()).await.unwrap();
        assert_eq!(summary.count("completed"), 1);
        h.service.get_job(&job.id).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stage_failures_are_retried_to_completion() {
        let h = harness(ScriptedStudio::new().with_failures("narration", 2));
        let job = h.service.submit(inputs()).await.unwrap();

        let summary = h.service.run_due_recovery(Utc::now()).await.unwrap();
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.count("completed"), 1);
        assert_eq!(summary.remaining_count, 0);
        assert!(!summary.budget_exhausted);

        let record = h.service.get_job(&job.id).await.unwrap();
        assert_eq!(record.stage, Stage::Completed);
        assert_eq!(record.attempts_for(PipelineStep::Narration), 3);
        for step in [
            PipelineStep::Script,
            PipelineStep::Visuals,
            PipelineStep::Assembly,
            PipelineStep::Thumbnail,
        ] {
            assert_eq!(record.attempts_for(step), 1, "{step}");
        }
        assert_eq!(h.studio.calls("script").await, 1);
        assert!(record.artifacts.thumbnail.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_skips_checkpointed_and_existing_artifacts() {
        let h = harness(ScriptedStudio::new());
        let jobs = h.service.orchestrator().jobs();

        // Script checkpointed; narration written but the stage never advanced
        let mut record = JobRecord::new(inputs());
        record
            .complete_step(StepOutput::Script("existing script".to_string()), 1)
            .unwrap();
        record.artifacts.audio = Some("mem://audio/existing".to_string());
        jobs.create(&record).await.unwrap();

        let done = h.service.orchestrator().run_job(&record.id).await.unwrap();
        assert_eq!(done.stage, Stage::Completed);
        assert_eq!(done.artifacts.script.as_deref(), Some("existing script"));
        assert_eq!(done.artifacts.audio.as_deref(), Some("mem://audio/existing"));
        assert_eq!(h.studio.calls("script").await, 0);
        assert_eq!(h.studio.calls("narration").await, 0);
        assert_eq!(h.studio.calls("visuals").await, 1);

        // A produced job is left alone
        h.service.orchestrator().run_job(&record.id).await.unwrap();
        assert_eq!(h.studio.calls("visuals").await, 1);
        assert_eq!(h.studio.calls("thumbnail").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_stage_is_requeued_then_resumes() {
        let h = harness(ScriptedStudio::new().with_failures("visuals", 3));
        let job = h.service.submit(inputs()).await.unwrap();
        let now = Utc::now();

        let summary = h.service.run_due_recovery(now).await.unwrap();
        assert_eq!(summary.count("requeued"), 1);

        let record = h.service.get_job(&job.id).await.unwrap();
        assert_eq!(record.stage, Stage::AudioGenerated);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.failed_at_step, Some(PipelineStep::Visuals));

        // Not due yet
        let summary = h.service.run_due_recovery(now).await.unwrap();
        assert_eq!(summary.processed_count, 0);

        let later = now + TimeDelta::minutes(5);
        let summary = h.service.run_due_recovery(later).await.unwrap();
        assert_eq!(summary.count("completed"), 1);

        let record = h.service.get_job(&job.id).await.unwrap();
        assert_eq!(record.stage, Stage::Completed);
        assert_eq!(record.attempts_for(PipelineStep::Visuals), 4);
        assert_eq!(h.studio.calls("narration").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_marks_job_failed_and_notifies() {
        let h = harness(ScriptedStudio::new().with_permanent_failure("script"));
        let job = h.service.submit(inputs()).await.unwrap();

        let summary = h.service.run_due_recovery(Utc::now()).await.unwrap();
        assert_eq!(summary.count("dead_lettered"), 1);
        assert_eq!(h.studio.calls("script").await, 1);

        let record = h.service.get_job(&job.id).await.unwrap();
        assert_eq!(record.stage, Stage::Failed);

        let messages = h.notifier.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Severity::Error);
        assert!(messages[0].1.contains(job.id.as_str()));

        let err = h
            .service
            .schedule_publish(&job.id, Utc::now(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Conflict(_)));

        // Reopen clears the dead letter and queues a fresh run
        let reopened = h.service.reopen(&job.id).await.unwrap();
        assert_eq!(reopened.stage, Stage::Pending);
        let stats = h.service.queue_status(Utc::now()).await.unwrap().recovery;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.dead_lettered, 0);

        let err = h.service.reopen(&job.id).await.unwrap_err();
        assert!(matches!(err, WorkerError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_recovery_entry_is_dropped_without_running() {
        let h = harness(ScriptedStudio::new());
        let job = h.service.submit(inputs()).await.unwrap();

        let summary = h
            .service
            .run_due_recovery(Utc::now() + TimeDelta::hours(25))
            .await
            .unwrap();
        assert_eq!(summary.count("expired"), 1);
        assert_eq!(summary.processed_count, 0);
        assert_eq!(summary.remaining_count, 0);
        assert_eq!(h.studio.calls("script").await, 0);

        let record = h.service.get_job(&job.id).await.unwrap();
        assert_eq!(record.stage, Stage::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_backs_off_then_dead_letters_with_notification() {
        let h = harness(ScriptedStudio::new().with_failures("publish", u32::MAX));
        let job = produced_job(&h).await;

        let schedule = h
            .service
            .schedule_publish(&job.id, Utc::now(), None)
            .await
            .unwrap();
        let queue = h.service.publishing_queue().queue();
        let mut now = Utc::now();

        for n in 1..5 {
            let summary = h.service.run_due_publishing(now).await.unwrap();
            assert_eq!(summary.count("requeued"), 1, "failure {n}");

            let due = queue.due_at(schedule.id.as_str()).await.unwrap().unwrap();
            let expected = now + TimeDelta::minutes(1 << n);
            assert!((due - expected).num_milliseconds().abs() <= 1);

            let stored = h.service.get_schedule(&schedule.id).await.unwrap();
            assert_eq!(stored.retry_count, n);
            assert_eq!(stored.status, ScheduleStatus::Scheduled);
            now = due;
        }
        assert!(h.notifier.messages().await.is_empty());

        let summary = h.service.run_due_publishing(now).await.unwrap();
        assert_eq!(summary.count("dead_lettered"), 1);

        let stored = h.service.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(stored.status, ScheduleStatus::Failed);
        assert!(stored.last_error.is_some());

        let stats = h.service.queue_status(now).await.unwrap().publishing;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.dead_lettered, 1);

        let messages = h.notifier.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains(schedule.id.as_str()));

        // Executor attempts per trigger times five triggers
        assert_eq!(h.studio.calls("publish").await, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_at_on_submission_schedules_on_completion() {
        let h = harness(ScriptedStudio::new());
        let publish_at = Utc::now() + TimeDelta::hours(1);
        let job = h
            .service
            .submit(inputs().with_publish_at(publish_at))
            .await
            .unwrap();

        h.service.run_due_recovery(Utc::now()).await.unwrap();
        let id = ScheduleId::for_job(&job.id);
        let schedule = h.service.get_schedule(&id).await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Scheduled);
        assert_eq!(schedule.metadata.title, "Octopus intelligence");

        // Not due yet
        let summary = h.service.run_due_publishing(Utc::now()).await.unwrap();
        assert_eq!(summary.processed_count, 0);
        assert_eq!(summary.remaining_count, 1);

        let later = publish_at + TimeDelta::minutes(1);
        let summary = h.service.run_due_publishing(later).await.unwrap();
        assert_eq!(summary.count("completed"), 1);

        let record = h.service.get_job(&job.id).await.unwrap();
        assert_eq!(record.stage, Stage::Published);
        let schedule = h.service.get_schedule(&id).await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Published);
        assert_eq!(schedule.published_url, record.artifacts.published_url);

        // Scheduling a published job again changes nothing
        let again = h.service.schedule_publish(&job.id, later, None).await.unwrap();
        assert_eq!(again.status, ScheduleStatus::Published);
        let summary = h.service.run_due_publishing(later).await.unwrap();
        assert_eq!(summary.processed_count, 0);
        assert_eq!(h.studio.calls("publish").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_waits_for_production() {
        let h = harness(ScriptedStudio::new());
        let job = h.service.submit(inputs()).await.unwrap();
        h.service
            .schedule_publish(&job.id, Utc::now(), None)
            .await
            .unwrap();

        let summary = h.service.run_due_publishing(Utc::now()).await.unwrap();
        assert_eq!(summary.count("requeued"), 1);
        assert_eq!(h.studio.calls("publish").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_schedule_is_idempotent() {
        let h = harness(ScriptedStudio::new());
        let job = produced_job(&h).await;
        let publish_at = Utc::now() + TimeDelta::hours(2);

        let schedule = h
            .service
            .schedule_publish(&job.id, publish_at, None)
            .await
            .unwrap();

        // Rescheduling moves the due time instead of adding an entry
        let moved = publish_at + TimeDelta::hours(1);
        h.service.schedule_publish(&job.id, moved, None).await.unwrap();
        let stats = h.service.queue_status(Utc::now()).await.unwrap().publishing;
        assert_eq!(stats.total, 1);
        let due = h
            .service
            .publishing_queue()
            .queue()
            .due_at(schedule.id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(due.timestamp_millis(), moved.timestamp_millis());

        let cancelled = h.service.cancel_schedule(&schedule.id).await.unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        let again = h.service.cancel_schedule(&schedule.id).await.unwrap();
        assert_eq!(again.status, ScheduleStatus::Cancelled);

        let stats = h.service.queue_status(Utc::now()).await.unwrap().publishing;
        assert_eq!(stats.total, 0);

        let summary = h.service.run_due_publishing(moved).await.unwrap();
        assert_eq!(summary.processed_count, 0);
        assert_eq!(h.studio.calls("publish").await, 0);

        // A cancelled schedule can be started over
        let fresh = h
            .service
            .schedule_publish(&job.id, publish_at, None)
            .await
            .unwrap();
        assert_eq!(fresh.status, ScheduleStatus::Scheduled);
        assert_eq!(fresh.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_defers_remaining_entries() {
        let h = harness(ScriptedStudio::new().with_delay(Duration::from_secs(20)));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.service.submit(inputs()).await.unwrap().id);
        }

        // Five stages at 20s each overruns the 50s budget after one job
        let summary = h.service.run_due_recovery(Utc::now()).await.unwrap();
        assert!(summary.budget_exhausted);
        assert_eq!(summary.count("completed"), 1);
        assert_eq!(summary.count("deferred"), 2);
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.remaining_count, 2);

        let reasons: Vec<_> = summary
            .outcomes
            .iter()
            .filter_map(|r| match &r.outcome {
                EntryOutcome::Deferred { reason } => Some(reason.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(reasons.len(), 2);
        assert!(reasons.iter().all(|r| r.starts_with("Budget exhausted")));

        let summary = h.service.run_due_recovery(Utc::now()).await.unwrap();
        assert_eq!(summary.count("completed"), 1);
        assert_eq!(summary.remaining_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_trigger_jobs_are_resumed() {
        let h = harness(ScriptedStudio::new().with_delay(Duration::from_secs(20)));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.service.submit(inputs()).await.unwrap().id);
        }

        // The invocation dies partway through its first job
        let now = Utc::now();
        let killed = tokio::time::timeout(
            Duration::from_secs(60),
            h.service.run_due_recovery(now),
        )
        .await;
        assert!(killed.is_err());
        let stats = h.service.queue_status(now).await.unwrap().recovery;
        assert_eq!(stats.claimed, 3);

        // Later triggers pick up the untouched jobs at once and the
        // interrupted one after its lease runs out
        let lease = TimeDelta::from_std(h.service.config().claim_lease).unwrap();
        let mut later = now + lease + TimeDelta::seconds(1);
        let mut completed = 0;
        for _ in 0..10 {
            let summary = h.service.run_due_recovery(later).await.unwrap();
            completed += summary.count("completed");
            if completed == 3 {
                break;
            }
            later += TimeDelta::minutes(1);
        }
        assert_eq!(completed, 3);

        for id in &ids {
            let record = h.service.get_job(id).await.unwrap();
            assert_eq!(record.stage, Stage::Completed);
        }
        let stats = h.service.queue_status(later).await.unwrap().recovery;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.claimed, 0);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trigger_hands_back_unstarted_entries() {
        let h = harness(ScriptedStudio::new().with_delay(Duration::from_secs(20)));
        for _ in 0..3 {
            h.service.submit(inputs()).await.unwrap();
        }

        let now = Utc::now();
        let cut = tokio::time::timeout(
            Duration::from_secs(30),
            h.service.run_due_recovery(now),
        )
        .await;
        assert!(cut.is_err());

        // Same clock: the interrupted job is still leased, the other two run
        let summary = h.service.run_due_recovery(now).await.unwrap();
        assert_eq!(summary.count("completed"), 1);
        assert_eq!(summary.count("deferred"), 1);
        let stats = h.service.queue_status(now).await.unwrap().recovery;
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_jobs_run_first() {
        let h = harness(ScriptedStudio::new().with_delay(Duration::from_secs(20)));
        let low = h.service.submit(inputs()).await.unwrap();
        let high = h
            .service
            .submit(inputs().with_priority(10))
            .await
            .unwrap();

        // Budget allows one job; it must be the high-priority one
        let summary = h.service.run_due_recovery(Utc::now()).await.unwrap();
        assert_eq!(summary.count("completed"), 1);
        assert_eq!(summary.outcomes[0].member, high.id.as_str());
        assert_eq!(summary.outcomes[1].member, low.id.as_str());
        assert!(matches!(
            summary.outcomes[1].outcome,
            EntryOutcome::Deferred { .. }
        ));
    }

    #[tokio::test]
    async fn test_trigger_is_single_flight() {
        let h = harness(ScriptedStudio::new());
        let guard = h.service.publish_batch.begin().unwrap();

        let err = h.service.run_due_publishing(Utc::now()).await.unwrap_err();
        assert!(err.is_already_processing());

        // The other queue is independent
        assert!(h.service.run_due_recovery(Utc::now()).await.is_ok());

        drop(guard);
        assert!(h.service.run_due_publishing(Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_topic() {
        let h = harness(ScriptedStudio::new());
        let err = h
            .service
            .submit(JobInputs::new("   ", "chan-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Model(_)));
        assert_eq!(
            h.service.queue_status(Utc::now()).await.unwrap().recovery.total,
            0
        );
    }
}
