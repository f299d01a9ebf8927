//! Drives one claimed job through its remaining stages.
//!
//! Every state change goes through the [`JobStore`] with the version last
//! observed. A conflicting write is retried against the reloaded job as long
//! as this worker still owns the lease; once ownership is gone the run stops
//! without touching the job again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docpipe_core::WorkerId;
use docpipe_jobs::{Job, JobConfig, JobStatus, StagePatch, TransitionFields};

use super::registry::StageRegistry;
use super::retry::RetryPolicy;
use super::stage::{Stage, StageError, StageErrorKind};
use crate::jobs::{JobStore, JobStoreError};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound for a single stage invocation.
    pub stage_timeout: Duration,
    /// Requeue delay after a retryable failure.
    pub retry_policy: RetryPolicy,
    /// Extra runs granted to a stage whose output fails its quality gate.
    pub quality_regenerations: u32,
    /// Bound on reload-and-retry after a version conflict.
    pub max_conflict_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            retry_policy: RetryPolicy::default(),
            quality_regenerations: 1,
            max_conflict_retries: 5,
        }
    }
}

/// How a run ended, and what the worker should tell the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every stage completed; ack.
    Completed,
    /// Cancellation was honoured at a checkpoint; ack.
    Cancelled,
    /// The job is `failed`. Dead-letter when retries ran out, ack otherwise.
    Failed { error: String, dead_letter: bool },
    /// A retry was consumed; nack with `delay`.
    Requeue { delay: Duration },
    /// Another worker owns the job now; leave the delivery alone.
    LeaseLost,
}

#[derive(Debug, Clone)]
enum Write {
    Stage { index: usize, patch: StagePatch },
    Transition { next: JobStatus, fields: TransitionFields },
}

impl Write {
    fn is_cancel(&self) -> bool {
        matches!(
            self,
            Write::Transition {
                next: JobStatus::Cancelled,
                ..
            }
        )
    }
}

enum Persisted {
    Written(Job),
    CancelRequested(Job),
    LeaseLost,
}

/// Aborts the stage task if the run is dropped mid-stage.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn owns(job: &Job, worker: WorkerId) -> bool {
    job.status() == JobStatus::Processing && job.lease().is_some_and(|lease| lease.owner == worker)
}

/// Executes the stage pipeline for jobs claimed by a worker.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<StageRegistry>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<StageRegistry>, config: PipelineConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `job`, already claimed by `worker`, from its first incomplete stage.
    pub async fn run(&self, job: Job, worker: WorkerId) -> Result<RunOutcome, JobStoreError> {
        let job_id = job.id();
        let mut job = job;

        loop {
            if job.cancel_requested() {
                return self.finish_cancelled(job, worker).await;
            }
            let Some(index) = job.first_incomplete_stage() else {
                return self.finish_completed(job, worker).await;
            };
            let name = job.stages()[index].name.clone();

            let Some(stage) = self.registry.get(&name) else {
                error!(job_id = %job_id, stage = %name, "no stage registered under this name");
                let message = format!("stage '{name}' is not available");
                return self.fail_job(job, worker, message, false).await;
            };

            if !job.is_leased_by(worker, Utc::now()) {
                warn!(job_id = %job_id, stage = %name, "lease not held, not starting stage");
                return Ok(RunOutcome::LeaseLost);
            }

            job = match self
                .write(job, worker, Write::Stage { index, patch: StagePatch::Start })
                .await?
            {
                Persisted::Written(job) => job,
                Persisted::CancelRequested(job) => return self.finish_cancelled(job, worker).await,
                Persisted::LeaseLost => return Ok(RunOutcome::LeaseLost),
            };

            debug!(job_id = %job_id, stage = %name, stage_index = index, "stage started");
            let started = Instant::now();
            let input = job.stage_input(index).unwrap_or(JsonValue::Null);
            let result = self.invoke(stage, input, job.config().clone()).await;

            // Checkpoint: the in-flight result is discarded if cancellation
            // was requested while the stage ran.
            let latest = self.store.get(job_id).await?;
            if !owns(&latest, worker) {
                warn!(job_id = %job_id, stage = %name, "lease lost while stage ran");
                return Ok(RunOutcome::LeaseLost);
            }
            if latest.cancel_requested() {
                info!(job_id = %job_id, stage = %name, "cancellation requested during stage, discarding its result");
                return self.finish_cancelled(latest, worker).await;
            }
            job = latest;

            match result {
                Ok(output) => {
                    job = match self
                        .write(job, worker, Write::Stage { index, patch: StagePatch::Complete { output } })
                        .await?
                    {
                        Persisted::Written(job) => job,
                        Persisted::CancelRequested(job) => {
                            return self.finish_cancelled(job, worker).await;
                        }
                        Persisted::LeaseLost => return Ok(RunOutcome::LeaseLost),
                    };
                    info!(
                        job_id = %job_id,
                        stage = %name,
                        stage_index = index,
                        progress = job.progress(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage completed"
                    );
                }
                Err(err) => return self.handle_stage_error(job, worker, index, &name, err).await,
            }
        }
    }

    async fn handle_stage_error(
        &self,
        job: Job,
        worker: WorkerId,
        index: usize,
        name: &str,
        err: StageError,
    ) -> Result<RunOutcome, JobStoreError> {
        let job_id = job.id();
        warn!(
            job_id = %job_id,
            stage = %name,
            stage_index = index,
            error_kind = %err.kind,
            retryable = err.retryable,
            retry_count = job.retry_count(),
            completed_stages = job.completed_stages(),
            progress = job.progress(),
            error = %err.message,
            "stage failed"
        );

        // Internals of unexpected failures stay in the logs.
        let visible = match err.kind {
            StageErrorKind::Fatal => "internal error".to_string(),
            _ => err.message.clone(),
        };

        let job = match self
            .write(job, worker, Write::Stage { index, patch: StagePatch::Fail { error: visible.clone() } })
            .await?
        {
            Persisted::Written(job) => job,
            Persisted::CancelRequested(job) => return self.finish_cancelled(job, worker).await,
            Persisted::LeaseLost => return Ok(RunOutcome::LeaseLost),
        };

        if !err.retryable {
            return self
                .fail_job(job, worker, format!("stage '{name}' failed: {visible}"), false)
                .await;
        }

        if job.retry_count() >= job.max_retries() {
            let message = format!(
                "stage '{name}' failed after {} retries: {visible}",
                job.retry_count()
            );
            return self.fail_job(job, worker, message, true).await;
        }

        let requeue = Write::Transition {
            next: JobStatus::Processing,
            fields: TransitionFields::default(),
        };
        match self.write(job, worker, requeue).await? {
            Persisted::Written(job) => {
                let delay = self.config.retry_policy.requeue_delay(job.retry_count());
                info!(
                    job_id = %job_id,
                    retry_count = job.retry_count(),
                    max_retries = job.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    "job requeued for retry"
                );
                Ok(RunOutcome::Requeue { delay })
            }
            Persisted::CancelRequested(job) => self.finish_cancelled(job, worker).await,
            Persisted::LeaseLost => Ok(RunOutcome::LeaseLost),
        }
    }

    async fn fail_job(
        &self,
        job: Job,
        worker: WorkerId,
        message: String,
        dead_letter: bool,
    ) -> Result<RunOutcome, JobStoreError> {
        let transition = Write::Transition {
            next: JobStatus::Failed,
            fields: TransitionFields::error(message.clone()),
        };
        match self.write(job, worker, transition).await? {
            Persisted::Written(job) => {
                error!(job_id = %job.id(), retry_count = job.retry_count(), dead_letter, error = %message, "job failed");
                Ok(RunOutcome::Failed {
                    error: message,
                    dead_letter,
                })
            }
            Persisted::CancelRequested(job) => self.finish_cancelled(job, worker).await,
            Persisted::LeaseLost => Ok(RunOutcome::LeaseLost),
        }
    }

    async fn finish_completed(&self, job: Job, worker: WorkerId) -> Result<RunOutcome, JobStoreError> {
        let fields = job
            .stages()
            .last()
            .and_then(|stage| stage.output.clone())
            .map(TransitionFields::result)
            .unwrap_or_default();
        let transition = Write::Transition {
            next: JobStatus::Completed,
            fields,
        };
        match self.write(job, worker, transition).await? {
            Persisted::Written(job) => {
                info!(job_id = %job.id(), retry_count = job.retry_count(), "job completed");
                Ok(RunOutcome::Completed)
            }
            Persisted::CancelRequested(job) => self.finish_cancelled(job, worker).await,
            Persisted::LeaseLost => Ok(RunOutcome::LeaseLost),
        }
    }

    async fn finish_cancelled(&self, job: Job, worker: WorkerId) -> Result<RunOutcome, JobStoreError> {
        let transition = Write::Transition {
            next: JobStatus::Cancelled,
            fields: TransitionFields::default(),
        };
        match self.write(job, worker, transition).await? {
            Persisted::Written(job) => {
                info!(job_id = %job.id(), completed_stages = job.completed_stages(), "job cancelled");
                Ok(RunOutcome::Cancelled)
            }
            Persisted::CancelRequested(_) | Persisted::LeaseLost => Ok(RunOutcome::LeaseLost),
        }
    }

    /// Version-guarded write with reload-and-retry on conflict.
    async fn write(&self, mut job: Job, worker: WorkerId, write: Write) -> Result<Persisted, JobStoreError> {
        let mut conflicts = 0;
        loop {
            let result = match &write {
                Write::Stage { index, patch } => {
                    self.store
                        .update_stage(job.id(), job.version(), *index, patch.clone())
                        .await
                }
                Write::Transition { next, fields } => {
                    self.store
                        .transition(job.id(), job.version(), *next, fields.clone())
                        .await
                }
            };

            match result {
                Ok(updated) => return Ok(Persisted::Written(updated)),
                Err(err) if err.is_conflict() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    let latest = self.store.get(job.id()).await?;
                    if !owns(&latest, worker) {
                        warn!(job_id = %job.id(), "lease lost to another worker");
                        return Ok(Persisted::LeaseLost);
                    }
                    if latest.cancel_requested() && !write.is_cancel() {
                        return Ok(Persisted::CancelRequested(latest));
                    }
                    debug!(job_id = %job.id(), conflicts, "version conflict, retrying write");
                    job = latest;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run a stage, granting quality-gate failures their regenerations.
    async fn invoke(
        &self,
        stage: Arc<dyn Stage>,
        input: JsonValue,
        config: JobConfig,
    ) -> Result<JsonValue, StageError> {
        let mut regenerations = 0;
        loop {
            match self.invoke_once(stage.clone(), input.clone(), config.clone()).await {
                Err(err) if err.kind == StageErrorKind::QualityGate => {
                    if regenerations < self.config.quality_regenerations {
                        regenerations += 1;
                        warn!(stage = %stage.name(), regenerations, error = %err.message, "quality gate rejected output, regenerating");
                        continue;
                    }
                    return Err(StageError::validation(format!(
                        "quality check still failing after {regenerations} regeneration(s): {}",
                        err.message
                    )));
                }
                other => return other,
            }
        }
    }

    /// One bounded invocation. Panics surface as fatal errors, timeouts as
    /// retryable ones.
    async fn invoke_once(
        &self,
        stage: Arc<dyn Stage>,
        input: JsonValue,
        config: JobConfig,
    ) -> Result<JsonValue, StageError> {
        let mut task = AbortOnDrop(tokio::spawn(async move { stage.execute(input, &config).await }));
        match tokio::time::timeout(self.config.stage_timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(StageError::fatal("stage panicked")),
            Ok(Err(join_err)) => Err(StageError::fatal(format!("stage task ended abnormally: {join_err}"))),
            Err(_) => Err(StageError::timeout(self.config.stage_timeout)),
        }
    }
}
