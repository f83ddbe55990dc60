//! Pipeline orchestrator.
//!
//! Runs the production stages of one job in order, checkpointing the record
//! after every stage so that a re-invocation resumes where the last one
//! stopped. Stages whose artifact already exists are never run again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use reelsmith_models::{
    JobId, JobRecord, PipelineStep, PublishSchedule, ScheduleId, ScheduleStatus, StepOutput,
};
use reelsmith_queue::RateLimiter;
use reelsmith_store::{JobRepository, ScheduleRepository, StoreError};
use tracing::Instrument;

use crate::config::{Provider, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::with_retry;
use crate::studio::{ContentStudio, Publisher};

/// Rate-limited provider behind each stage.
pub fn provider_for(step: PipelineStep) -> Provider {
    match step {
        PipelineStep::Script => Provider::Llm,
        PipelineStep::Narration => Provider::Tts,
        PipelineStep::Visuals => Provider::Images,
        PipelineStep::Assembly | PipelineStep::Thumbnail => Provider::Render,
    }
}

fn missing_artifact(step: PipelineStep, what: &str) -> WorkerError {
    WorkerError::permanent(format!("{} needs the {} artifact, which is missing", step, what))
}

fn not_found_as(err: StoreError, missing: impl FnOnce() -> WorkerError) -> WorkerError {
    match err {
        StoreError::NotFound(_) => missing(),
        other => other.into(),
    }
}

/// Sequences stages for one job at a time.
pub struct PipelineOrchestrator {
    jobs: JobRepository,
    schedules: ScheduleRepository,
    studio: Arc<dyn ContentStudio>,
    publisher: Arc<dyn Publisher>,
    limiter: RateLimiter,
    config: WorkerConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        jobs: JobRepository,
        schedules: ScheduleRepository,
        studio: Arc<dyn ContentStudio>,
        publisher: Arc<dyn Publisher>,
        limiter: RateLimiter,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            schedules,
            studio,
            publisher,
            limiter,
            config,
        }
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    pub fn schedules(&self) -> &ScheduleRepository {
        &self.schedules
    }

    async fn load_job(&self, job_id: &JobId) -> WorkerResult<JobRecord> {
        self.jobs
            .require(job_id)
            .await
            .map_err(|e| not_found_as(e, || WorkerError::JobNotFound(job_id.to_string())))
    }

    /// Checkpoint a record after its stage succeeded.
    ///
    /// A failed write means the stage's work is not durable; the caller sees a
    /// transient error and the stage runs again on the next attempt.
    async fn checkpoint(&self, record: &JobRecord, step: PipelineStep) -> WorkerResult<()> {
        self.jobs.save(record).await.map_err(|e| {
            WorkerError::transient(format!("failed to checkpoint {} for job {}: {}", step, record.id, e))
        })
    }

    /// Run every stage after the job's current one.
    ///
    /// Returns the record as persisted after the last completed stage. A
    /// produced (completed or published) job is returned unchanged.
    pub async fn run_job(&self, job_id: &JobId) -> WorkerResult<JobRecord> {
        let mut record = self.load_job(job_id).await?;
        let logger = JobLogger::new(job_id, "pipeline");

        if record.is_failed() {
            return Err(WorkerError::permanent(format!(
                "job {} has failed; reopen it before running",
                job_id
            )));
        }
        if record.stage.is_produced() {
            return Ok(record);
        }

        let span = logger.create_span();
        async move {
            logger.log_start(&format!("resuming at stage {}", record.stage));

            for step in record.pending_steps() {
                if record.artifacts.has(step) {
                    record.adopt_existing(step)?;
                    self.checkpoint(&record, step).await?;
                    logger.log_skip(step);
                    continue;
                }
                self.run_step(&mut record, step, &logger).await?;
            }

            metrics::record_job_completed();
            logger.log_completion(&format!("stage {}", record.stage));
            Ok::<_, WorkerError>(record)
        }
        .instrument(span)
        .await
    }

    async fn run_step(
        &self,
        record: &mut JobRecord,
        step: PipelineStep,
        logger: &JobLogger,
    ) -> WorkerResult<()> {
        let retry = self.config.retry_config(step.as_str());
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = {
            let current: &JobRecord = record;
            let attempts = &attempts;
            with_retry(&retry, move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.execute_step(step, current)
            })
            .await
        };
        let attempts = attempts.load(Ordering::SeqCst);
        let elapsed = started.elapsed();

        match result {
            Ok(output) => {
                metrics::record_stage(step, true, elapsed.as_secs_f64());
                record.complete_step(output, attempts)?;
                self.checkpoint(record, step).await?;
                logger.log_stage(step, attempts, elapsed);
                Ok(())
            }
            Err(e) => {
                metrics::record_stage(step, false, elapsed.as_secs_f64());
                logger.log_error(&format!("{} failed after {} attempts: {}", step, attempts, e));
                record.record_failure(step, attempts, e.to_string());
                if let Err(save_err) = self.jobs.save(record).await {
                    logger.log_warning(&format!("failed to record failure: {}", save_err));
                }
                Err(e)
            }
        }
    }

    /// One attempt at a stage: wait for the provider's rate limit, then call it.
    async fn execute_step(&self, step: PipelineStep, record: &JobRecord) -> WorkerResult<StepOutput> {
        let provider = provider_for(step);
        self.limiter
            .rate_limit(provider.key(), self.config.provider_limits.limit_for(provider))
            .await;

        let inputs = &record.inputs;
        let artifacts = &record.artifacts;
        match step {
            PipelineStep::Script => Ok(StepOutput::Script(
                self.studio.generate_script(inputs).await?,
            )),
            PipelineStep::Narration => {
                let script = artifacts
                    .script
                    .as_deref()
                    .ok_or_else(|| missing_artifact(step, "script"))?;
                Ok(StepOutput::Audio(
                    self.studio
                        .generate_narration(script, inputs.voice.as_deref())
                        .await?,
                ))
            }
            PipelineStep::Visuals => {
                let script = artifacts
                    .script
                    .as_deref()
                    .ok_or_else(|| missing_artifact(step, "script"))?;
                Ok(StepOutput::Visuals(
                    self.studio.generate_visuals(script, inputs).await?,
                ))
            }
            PipelineStep::Assembly => {
                let audio = artifacts
                    .audio
                    .as_deref()
                    .ok_or_else(|| missing_artifact(step, "audio"))?;
                let visuals = artifacts
                    .visuals
                    .as_deref()
                    .ok_or_else(|| missing_artifact(step, "visuals"))?;
                Ok(StepOutput::Video(
                    self.studio.assemble_video(audio, visuals, inputs).await?,
                ))
            }
            PipelineStep::Thumbnail => {
                let video = artifacts
                    .video
                    .as_deref()
                    .ok_or_else(|| missing_artifact(step, "video"))?;
                Ok(StepOutput::Thumbnail(
                    self.studio.generate_thumbnail(video, inputs).await?,
                ))
            }
        }
    }

    /// Publish the job behind a schedule. Returns the public URL.
    ///
    /// Guarded on both sides: an already-published record or schedule returns
    /// the existing URL without calling the publisher again.
    pub async fn publish_job(&self, schedule_id: &ScheduleId) -> WorkerResult<String> {
        let mut schedule = self
            .schedules
            .require(schedule_id)
            .await
            .map_err(|e| not_found_as(e, || WorkerError::ScheduleNotFound(schedule_id.to_string())))?;

        match schedule.status {
            ScheduleStatus::Scheduled => {}
            ScheduleStatus::Published => {
                if let Some(url) = schedule.published_url.clone() {
                    return Ok(url);
                }
            }
            status => {
                return Err(WorkerError::permanent(format!(
                    "schedule {} is {}",
                    schedule_id, status
                )));
            }
        }

        let mut record = self.load_job(&schedule.job_id).await?;
        let logger = JobLogger::new(&record.id, "publish");

        if let Some(url) = record.artifacts.published_url.clone() {
            logger.log_warning("already published; syncing schedule");
            self.finish_schedule(&mut schedule, &url).await?;
            return Ok(url);
        }

        // Still in production: back off and try again later
        if !record.is_failed() && !record.stage.is_produced() {
            return Err(WorkerError::transient(format!(
                "job {} is not produced yet (stage {})",
                record.id, record.stage
            )));
        }
        let video = record.publishable_video()?.to_string();
        logger.log_start(&format!("publishing to channel {}", schedule.channel_id));

        let retry = self.config.retry_config("publish");
        let url = {
            let schedule = &schedule;
            let video = video.as_str();
            with_retry(&retry, move || async move {
                self.limiter
                    .rate_limit(
                        Provider::Publish.key(),
                        self.config.provider_limits.limit_for(Provider::Publish),
                    )
                    .await;
                self.publisher
                    .publish(video, &schedule.channel_id, &schedule.metadata)
                    .await
            })
            .await?
        };

        record.mark_published(url.clone());
        self.jobs.save(&record).await.map_err(|e| {
            WorkerError::transient(format!("failed to record publication of {}: {}", record.id, e))
        })?;
        self.finish_schedule(&mut schedule, &url).await?;

        metrics::record_published();
        logger.log_completion(&format!("published at {}", url));
        Ok(url)
    }

    async fn finish_schedule(&self, schedule: &mut PublishSchedule, url: &str) -> WorkerResult<()> {
        schedule.mark_published(url);
        self.schedules.save(schedule).await.map_err(|e| {
            WorkerError::transient(format!("failed to record publication of {}: {}", schedule.id, e))
        })
    }

    /// Reopen a failed job. Artifacts are kept; the resume stage follows them.
    pub async fn reopen(&self, job_id: &JobId) -> WorkerResult<JobRecord> {
        let mut record = self.load_job(job_id).await?;
        if !record.reopen() {
            return Err(WorkerError::conflict(format!(
                "job {} is at stage {}, only failed jobs can be reopened",
                job_id, record.stage
            )));
        }
        self.jobs.save(&record).await?;
        JobLogger::new(job_id, "pipeline")
            .log_progress(&format!("reopened, resuming at stage {}", record.stage));
        Ok(record)
    }

    /// Move a job to the terminal failed state.
    pub async fn mark_failed(&self, job_id: &JobId, error: &str) -> WorkerResult<JobRecord> {
        let mut record = self.load_job(job_id).await?;
        record.mark_failed(error);
        self.jobs.save(&record).await?;
        metrics::record_job_failed();
        JobLogger::new(job_id, "pipeline").log_error(&format!("marked failed: {}", error));
        Ok(record)
    }
}
