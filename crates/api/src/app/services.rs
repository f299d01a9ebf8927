use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use docpipe_core::JobId;
use docpipe_infra::{
    config::{AppConfig, Persistence},
    jobs::{InMemoryJobStore, JobFilter, JobPage, JobStats, JobStore, JobStoreError, NewJob, PostgresJobStore},
    pipeline::{learning_pipeline_registry, StageRegistry},
    queue::{DeadLetterEntry, InMemoryJobQueue, JobQueue, QueueDepth, QueueError},
};
use docpipe_jobs::{Job, JobConfig, JobInput, JobStatus, TransitionFields};

/// Optimistic-concurrency retries for API-side read-modify-write.
const MAX_CONFLICT_RETRIES: usize = 5;

/// Page size used when walking the store at startup.
const RECOVERY_PAGE_SIZE: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The job exists but the request does not apply to its current state.
    #[error("{0}")]
    InvalidState(String),
}

/// What `DELETE /jobs/{id}` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The job was still running; cancellation was requested instead.
    CancelRequested,
    Deleted,
}

/// Store, queue and stage registry shared by the handlers and the worker pool.
pub struct AppServices {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<StageRegistry>,
    default_max_retries: u32,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<StageRegistry>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            default_max_retries,
        }
    }

    /// In-memory store and queue with the learning pipeline (dev/test).
    pub fn in_memory(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryJobQueue::new(config.queue)),
            Arc::new(learning_pipeline_registry()?),
            config.default_max_retries,
        ))
    }

    /// Build services for the configured persistence.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        match &config.persistence {
            Persistence::InMemory => {
                warn!("using in-memory job store; jobs are lost on restart");
                Self::in_memory(config)
            }
            Persistence::Postgres { database_url } => {
                let pool = PgPool::connect(database_url).await?;
                let store = PostgresJobStore::new(pool);
                store.ensure_schema().await?;
                info!("using postgres job store");
                Ok(Self::new(
                    Arc::new(store),
                    Arc::new(InMemoryJobQueue::new(config.queue)),
                    Arc::new(learning_pipeline_registry()?),
                    config.default_max_retries,
                ))
            }
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> Arc<StageRegistry> {
        self.registry.clone()
    }

    /// Persist a new job and hand it to the queue.
    pub async fn create_job(
        &self,
        input: JobInput,
        config: JobConfig,
        stages: Option<Vec<String>>,
    ) -> Result<Job, ServiceError> {
        let stage_names = self
            .registry
            .resolve_pipeline(stages)
            .map_err(JobStoreError::from)?;

        let job = self
            .store
            .create(NewJob {
                input,
                config,
                stage_names,
                default_max_retries: self.default_max_retries,
            })
            .await?;
        self.queue.enqueue(job.id()).await?;

        info!(job_id = %job.id(), stages = job.stage_count(), "job submitted");
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, ServiceError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<JobPage, ServiceError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn stats(&self) -> Result<(JobStats, QueueDepth), ServiceError> {
        let jobs = self.store.stats().await?;
        let queue = self.queue.depth().await?;
        Ok((jobs, queue))
    }

    /// Request cooperative cancellation. Returns whether the request was
    /// accepted together with the job as it now stands.
    pub async fn cancel_job(&self, id: JobId) -> Result<(bool, Job), ServiceError> {
        let accepted = self.store.request_cancel(id).await?;
        let job = self.store.get(id).await?;
        if accepted {
            info!(job_id = %id, status = %job.status(), "cancellation requested");
        }
        Ok((accepted, job))
    }

    /// Resume a failed job from its first non-completed stage.
    pub async fn retry_job(&self, id: JobId) -> Result<Job, ServiceError> {
        let mut conflicts = 0;
        let job = loop {
            let job = self.store.get(id).await?;
            if job.status() != JobStatus::Failed {
                return Err(ServiceError::InvalidState(format!(
                    "only failed jobs can be retried (status: {})",
                    job.status()
                )));
            }
            if !job.can_retry() {
                return Err(ServiceError::InvalidState(format!(
                    "retry limit reached ({} of {})",
                    job.retry_count(),
                    job.max_retries()
                )));
            }

            match self
                .store
                .transition(id, job.version(), JobStatus::Processing, TransitionFields::default())
                .await
            {
                Ok(job) => break job,
                Err(e) if e.is_conflict() && conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.queue.enqueue(id).await?;
        info!(
            job_id = %id,
            retry_count = job.retry_count(),
            stage_index = job.current_stage_index(),
            "job resubmitted"
        );
        Ok(job)
    }

    /// Delete a finished job, or cancel it if it is still pending or processing.
    pub async fn delete_job(&self, id: JobId) -> Result<Removal, ServiceError> {
        let job = self.store.get(id).await?;
        match job.status() {
            JobStatus::Pending | JobStatus::Processing => {
                self.store.request_cancel(id).await?;
                info!(job_id = %id, "delete requested on running job; cancelling instead");
                Ok(Removal::CancelRequested)
            }
            _ => {
                self.store.delete(id).await?;
                self.queue.forget(id).await?;
                info!(job_id = %id, "job deleted");
                Ok(Removal::Deleted)
            }
        }
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, ServiceError> {
        Ok(self.queue.dead_letters(limit).await?)
    }

    /// Enqueue every job that was pending or processing when the process last
    /// stopped. Processing jobs are claimed again once their lease lapses.
    pub async fn recover_unfinished(&self) -> Result<usize, ServiceError> {
        let mut recovered = 0;
        for status in [JobStatus::Pending, JobStatus::Processing] {
            let mut page = 1;
            loop {
                let batch = self
                    .store
                    .list(JobFilter {
                        status: Some(status),
                        page,
                        page_size: RECOVERY_PAGE_SIZE,
                    })
                    .await?;
                for job in &batch.items {
                    self.queue.enqueue(job.id()).await?;
                    recovered += 1;
                }
                if page as usize >= batch.pages() {
                    break;
                }
                page += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "re-enqueued unfinished jobs");
        }
        Ok(recovered)
    }
}
