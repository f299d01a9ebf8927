//! Read projections of a job exposed across the API boundary.
//!
//! Lease internals and stage outputs stay inside the store; clients see
//! status, progress and the single `error_message` text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use docpipe_core::JobId;

use crate::config::{JobConfig, JobInput};
use crate::job::{Job, StageRecord};
use crate::status::{JobStatus, StageStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageView {
    pub index: usize,
    pub name: String,
    pub status: StageStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&StageRecord> for StageView {
    fn from(stage: &StageRecord) -> Self {
        Self {
            index: stage.index,
            name: stage.name.clone(),
            status: stage.status,
            error: stage.error.clone(),
            started_at: stage.started_at,
            completed_at: stage.completed_at,
        }
    }
}

/// Full job projection (`GET /jobs/{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub input: JobInput,
    pub config: JobConfig,
    pub stages: Vec<StageView>,
    pub current_stage_index: usize,
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub version: u64,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_reference: Option<JsonValue>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id(),
            status: job.status(),
            input: job.input().clone(),
            config: job.config().clone(),
            stages: job.stages().iter().map(StageView::from).collect(),
            current_stage_index: job.current_stage_index(),
            progress: job.progress(),
            retry_count: job.retry_count(),
            max_retries: job.max_retries(),
            version: job.version(),
            cancel_requested: job.cancel_requested(),
            created_at: job.created_at(),
            updated_at: job.updated_at(),
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            error_message: job.error_message().map(str::to_string),
            result_reference: job.result_reference().cloned(),
        }
    }
}

/// Lightweight projection for frequent polling (`GET /jobs/{id}/status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub result_reference: Option<JsonValue>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id(),
            status: job.status(),
            progress: job.progress(),
            error_message: job.error_message().map(str::to_string),
            result_reference: job.result_reference().cloned(),
        }
    }
}
