//! Postgres-backed job store.
//!
//! Each job is one row: the serialized aggregate in `doc` plus the columns we
//! filter and guard on (`status`, `version`, `created_at`). Mutations run in a
//! transaction that locks the row, checks the version, applies the domain
//! method and writes back with `WHERE version = $expected`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Storage` (duplicate id) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |
//!
//! Version conflicts never surface as SQL errors: the `WHERE version = $expected`
//! guard catches them and they are reported as `Conflict`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use docpipe_core::{ExpectedVersion, JobId, WorkerId};
use docpipe_jobs::{Job, JobError, JobStatus, StagePatch, TransitionFields};

use super::store::{
    check_version, lease_deadline, JobFilter, JobPage, JobStats, JobStore, JobStoreError, NewJob,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS docpipe_jobs (
    id          UUID PRIMARY KEY,
    status      TEXT NOT NULL,
    version     BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    doc         JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS docpipe_jobs_status_created_idx
    ON docpipe_jobs (status, created_at DESC);
"#;

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and index if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn load_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query("SELECT doc FROM docpipe_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_for_update", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        decode_doc(&row)
    }

    /// Version-checked read-modify-write inside one transaction.
    async fn mutate<F>(
        &self,
        operation: &str,
        id: JobId,
        expected: ExpectedVersion,
        apply: F,
    ) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut job = Self::load_for_update(&mut tx, id).await?;
        let current = job.version();
        if let Err(conflict) = check_version(id, expected, current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(conflict);
        }

        if let Err(e) = apply(&mut job) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e.into());
        }

        let result = sqlx::query(
            r#"
            UPDATE docpipe_jobs
            SET status = $2, version = $3, updated_at = $4, doc = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(id.as_uuid())
        .bind(job.status().as_str())
        .bind(to_db_version(job.version()))
        .bind(job.updated_at())
        .bind(Json(&job))
        .bind(to_db_version(current))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::Conflict {
                id,
                expected,
                actual: current,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new_job), err)]
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        let job = Job::new(
            JobId::new(),
            new_job.input,
            new_job.config,
            new_job.stage_names,
            new_job.default_max_retries,
            Utc::now(),
        )?;

        sqlx::query(
            r#"
            INSERT INTO docpipe_jobs (id, status, version, created_at, updated_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id().as_uuid())
        .bind(job.status().as_str())
        .bind(to_db_version(job.version()))
        .bind(job.created_at())
        .bind(job.updated_at())
        .bind(Json(&job))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query("SELECT doc FROM docpipe_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        decode_doc(&row)
    }

    #[instrument(skip(self), fields(job_id = %id, worker_id = %worker), err)]
    async fn claim(
        &self,
        id: JobId,
        expected_version: u64,
        worker: WorkerId,
        lease_for: Duration,
    ) -> Result<Job, JobStoreError> {
        let until = lease_deadline(lease_for)?;
        self.mutate("claim", id, expected_version.into(), move |job| {
            job.claim(worker, until, Utc::now())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id, worker_id = %worker), err)]
    async fn renew_lease(
        &self,
        id: JobId,
        expected_version: u64,
        worker: WorkerId,
        lease_for: Duration,
    ) -> Result<Job, JobStoreError> {
        let until = lease_deadline(lease_for)?;
        self.mutate("renew_lease", id, expected_version.into(), move |job| {
            job.renew_lease(worker, until, Utc::now())
        })
        .await
    }

    #[instrument(skip(self, patch), fields(job_id = %id), err)]
    async fn update_stage(
        &self,
        id: JobId,
        expected_version: u64,
        stage_index: usize,
        patch: StagePatch,
    ) -> Result<Job, JobStoreError> {
        self.mutate("update_stage", id, expected_version.into(), move |job| {
            job.apply_stage_patch(stage_index, patch, Utc::now())
        })
        .await
    }

    #[instrument(skip(self, fields), fields(job_id = %id), err)]
    async fn transition(
        &self,
        id: JobId,
        expected_version: u64,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobStoreError> {
        self.mutate("transition", id, expected_version.into(), move |job| {
            job.apply_transition(next, fields, Utc::now())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn request_cancel(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut accepted = false;
        self.mutate("request_cancel", id, ExpectedVersion::Any, |job| {
            accepted = job.request_cancel(Utc::now()).accepted();
            Ok(())
        })
        .await?;
        Ok(accepted)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: JobFilter) -> Result<JobPage, JobStoreError> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM docpipe_jobs WHERE ($1::TEXT IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_count", e))?;

        let offset = i64::from(filter.page.saturating_sub(1)) * i64::from(filter.page_size);
        let rows = sqlx::query(
            r#"
            SELECT doc FROM docpipe_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(i64::from(filter.page_size))
        .bind(offset)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let items = rows.iter().map(decode_doc).collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            items,
            total: usize::try_from(total).unwrap_or_default(),
            page: filter.page,
            page_size: filter.page_size,
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM docpipe_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM docpipe_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status: JobStatus = status.parse()?;
            stats.add(status, usize::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }
}

fn decode_doc(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let Json(job) = row
        .try_get::<Json<Job>, _>("doc")
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    Ok(job)
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation: a concurrent insert won.
                Some("23505") => JobStoreError::Storage(format!("duplicate job row ({msg})")),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
