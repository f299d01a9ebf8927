use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use docpipe_core::JobId;
use docpipe_infra::jobs::{JobFilter, JobPage, JobStats};
use docpipe_infra::queue::QueueDepth;
use docpipe_jobs::{JobConfig, JobInput, JobStatus, JobView};

use crate::app::errors;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
pub const MAX_DEAD_LETTER_LIMIT: usize = 1000;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(flatten)]
    pub input: JobInput,
    #[serde(default)]
    pub config: JobConfig,
    /// Ordered stage names; the server's default pipeline when absent.
    #[serde(default)]
    pub stages: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<JobStatus>().map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
            })?),
        };

        Ok(JobFilter {
            status,
            page: self.page.unwrap_or(1).max(1),
            page_size: self
                .page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLettersQuery {
    pub limit: Option<usize>,
}

impl DeadLettersQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
            .clamp(1, MAX_DEAD_LETTER_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub pages: usize,
    pub items: Vec<JobView>,
}

impl From<JobPage> for JobListResponse {
    fn from(page: JobPage) -> Self {
        Self {
            total: page.total,
            page: page.page,
            page_size: page.page_size,
            pages: page.pages(),
            items: page.items.iter().map(JobView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: JobId,
    /// False when the job had already finished.
    pub accepted: bool,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub jobs: JobStats,
    pub total: usize,
    pub queue: QueueDepth,
}

impl StatsResponse {
    pub fn new(jobs: JobStats, queue: QueueDepth) -> Self {
        Self {
            total: jobs.total(),
            jobs,
            queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_clamps_paging() {
        let filter = ListJobsQuery {
            status: None,
            page: Some(0),
            page_size: Some(500),
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.page_size, MAX_PAGE_SIZE);

        let filter = ListJobsQuery::default().into_filter().unwrap();
        assert_eq!(filter.page_size, DEFAULT_PAGE_SIZE);
        assert!(filter.status.is_none());
    }

    #[test]
    fn list_query_parses_status() {
        let filter = ListJobsQuery {
            status: Some("failed".into()),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.status, Some(JobStatus::Failed));

        let err = ListJobsQuery {
            status: Some("sleeping".into()),
            ..Default::default()
        }
        .into_filter()
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn create_request_takes_input_fields_at_top_level() {
        let body: CreateJobRequest = serde_json::from_value(serde_json::json!({
            "source_filename": "notes.pdf",
            "source_reference": "pdfs/1",
            "stages": ["load_document", "package_artifact"]
        }))
        .unwrap();
        assert_eq!(body.input.source_filename, "notes.pdf");
        assert_eq!(body.config, JobConfig::default());
        assert_eq!(body.stages.unwrap().len(), 2);
    }
}
