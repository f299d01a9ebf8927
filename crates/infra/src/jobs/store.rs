//! Job storage implementations.
//!
//! Every mutating operation takes the version the caller last observed and
//! fails with [`JobStoreError::Conflict`] when the stored job has moved on.
//! Stores never edit job fields directly; they load the aggregate, apply the
//! domain method and persist the result.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use docpipe_core::{DomainError, ExpectedVersion, JobId, WorkerId};
use docpipe_jobs::{Job, JobConfig, JobError, JobInput, JobStatus, StagePatch, TransitionFields};

/// Everything needed to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub input: JobInput,
    pub config: JobConfig,
    pub stage_names: Vec<String>,
    pub default_max_retries: u32,
}

/// Listing filter with 1-based pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl JobFilter {
    fn offset(&self) -> usize {
        self.page.saturating_sub(1) as usize * self.page_size as usize
    }
}

/// One page of jobs, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

impl JobPage {
    pub fn pages(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size as usize)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("version conflict on job {id}: expected version {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error(transparent)]
    Rejected(#[from] JobError),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobStoreError::Conflict { .. })
    }
}

/// Durable job state with optimistic concurrency.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job at version 0.
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Take exclusive processing rights for `lease_for`.
    async fn claim(
        &self,
        id: JobId,
        expected_version: u64,
        worker: WorkerId,
        lease_for: Duration,
    ) -> Result<Job, JobStoreError>;

    /// Push the caller's lease forward without touching anything else.
    async fn renew_lease(
        &self,
        id: JobId,
        expected_version: u64,
        worker: WorkerId,
        lease_for: Duration,
    ) -> Result<Job, JobStoreError>;

    async fn update_stage(
        &self,
        id: JobId,
        expected_version: u64,
        stage_index: usize,
        patch: StagePatch,
    ) -> Result<Job, JobStoreError>;

    async fn transition(
        &self,
        id: JobId,
        expected_version: u64,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError>;

    /// Ask for cooperative cancellation. Never blocks on the worker and is
    /// not version-guarded; returns whether the request was accepted.
    async fn request_cancel(&self, id: JobId) -> Result<bool, JobStoreError>;

    async fn list(&self, filter: JobFilter) -> Result<JobPage, JobStoreError>;

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Compare-and-swap guard shared by the store implementations.
pub(crate) fn check_version(id: JobId, expected: ExpectedVersion, actual: u64) -> Result<(), JobStoreError> {
    expected.check(actual).map_err(|err| match err {
        DomainError::VersionMismatch { expected, actual } => JobStoreError::Conflict {
            id,
            expected: ExpectedVersion::Exact(expected),
            actual,
        },
        other => JobStoreError::Invalid(other),
    })
}

pub(crate) fn lease_deadline(lease_for: Duration) -> Result<chrono::DateTime<Utc>, JobStoreError> {
    let invalid = |msg: String| JobStoreError::Invalid(DomainError::validation(msg));
    let lease_for = chrono::Duration::from_std(lease_for).map_err(|e| invalid(format!("lease duration: {e}")))?;
    Utc::now()
        .checked_add_signed(lease_for)
        .ok_or_else(|| invalid(format!("lease duration {lease_for} is out of range")))
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    /// Version-checked read-modify-write. The stored job is only replaced when
    /// `apply` succeeds.
    fn mutate<F>(&self, id: JobId, expected: ExpectedVersion, apply: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        check_version(id, expected, stored.version())?;

        let mut next = stored.clone();
        apply(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        let job = Job::new(
            JobId::new(),
            new_job.input,
            new_job.config,
            new_job.stage_names,
            new_job.default_max_retries,
            Utc::now(),
        )?;
        self.write()?.insert(job.id(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.read()?.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn claim(
        &self,
        id: JobId,
        expected_version: u64,
        worker: WorkerId,
        lease_for: Duration,
    ) -> Result<Job, JobStoreError> {
        let until = lease_deadline(lease_for)?;
        self.mutate(id, expected_version.into(), |job| job.claim(worker, until, Utc::now()))
    }

    async fn renew_lease(
        &self,
        id: JobId,
        expected_version: u64,
        worker: WorkerId,
        lease_for: Duration,
    ) -> Result<Job, JobStoreError> {
        let until = lease_deadline(lease_for)?;
        self.mutate(id, expected_version.into(), |job| {
            job.renew_lease(worker, until, Utc::now())
        })
    }

    async fn update_stage(
        &self,
        id: JobId,
        expected_version: u64,
        stage_index: usize,
        patch: StagePatch,
    ) -> Result<Job, JobStoreError> {
        self.mutate(id, expected_version.into(), |job| {
            job.apply_stage_patch(stage_index, patch, Utc::now())
        })
    }

    async fn transition(
        &self,
        id: JobId,
        expected_version: u64,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError> {
        self.mutate(id, expected_version.into(), |job| {
            job.apply_transition(next, fields, Utc::now())
        })
    }

    async fn request_cancel(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut accepted = false;
        self.mutate(id, ExpectedVersion::Any, |job| {
            accepted = job.request_cancel(Utc::now()).accepted();
            Ok(())
        })?;
        Ok(accepted)
    }

    async fn list(&self, filter: JobFilter) -> Result<JobPage, JobStoreError> {
        let jobs = self.read()?;
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|job| filter.status.is_none_or(|s| job.status() == s))
            .collect();

        // Newest first; v7 ids break ties in creation order.
        matching.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset())
            .take(filter.page_size as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            items,
            total,
            page: filter.page,
            page_size: filter.page_size,
        })
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        self.write()?
            .remove(&id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.status(), 1);
        }
        Ok(stats)
    }
}
