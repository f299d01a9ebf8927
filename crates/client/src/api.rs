//! HTTP client for the Job API.

use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use docpipe_core::JobId;
use docpipe_jobs::{JobConfig, JobStatus, JobStatusView, JobView};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("API error ({status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

/// Body of `POST /jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitJob {
    pub source_filename: String,
    pub source_reference: String,
    pub config: JobConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<String>>,
}

impl SubmitJob {
    pub fn new(source_filename: impl Into<String>, source_reference: impl Into<String>) -> Self {
        Self {
            source_filename: source_filename.into(),
            source_reference: source_reference.into(),
            config: JobConfig::default(),
            stages: None,
        }
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }
}

/// Query of `GET /jobs`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListJobs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobList {
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub pages: usize,
    pub items: Vec<JobView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResult {
    pub job_id: JobId,
    pub accepted: bool,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Deserialize)]
struct Submitted {
    job_id: JobId,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Client for one Job API deployment.
#[derive(Debug, Clone)]
pub struct JobApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl JobApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check connectivity by hitting the health endpoint.
    pub async fn health(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn submit(&self, job: &SubmitJob) -> Result<JobId, ClientError> {
        let resp = self.http.post(self.url("/jobs")).json(job).send().await?;
        let submitted: Submitted = decode(resp).await?;
        tracing::debug!(job_id = %submitted.job_id, "job submitted");
        Ok(submitted.job_id)
    }

    pub async fn job(&self, id: JobId) -> Result<JobView, ClientError> {
        let resp = self.http.get(self.url(&format!("/jobs/{id}"))).send().await?;
        decode(resp).await
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/jobs/{id}/status")))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list(&self, query: &ListJobs) -> Result<JobList, ClientError> {
        let resp = self.http.get(self.url("/jobs")).query(query).send().await?;
        decode(resp).await
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelResult, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/jobs/{id}/cancel")))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn retry(&self, id: JobId) -> Result<JobStatusView, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/jobs/{id}/retry")))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn delete(&self, id: JobId) -> Result<(), ClientError> {
        let resp = self.http.delete(self.url(&format!("/jobs/{id}"))).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(api_error(resp).await)
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    if !resp.status().is_success() {
        return Err(api_error(resp).await);
    }
    resp.json()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

async fn api_error(resp: Response) -> ClientError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
    ClientError::Api {
        status: status.as_u16(),
        code: if body.error.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unknown")
                .to_lowercase()
                .replace(' ', "_")
        } else {
            body.error
        },
        message: if body.message.is_empty() { text } else { body.message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_body_matches_api_shape() {
        let body = serde_json::to_value(
            SubmitJob::new("notes.pdf", "pdfs/1").with_stages(["load_document", "package_artifact"]),
        )
        .unwrap();
        assert_eq!(body["source_filename"], "notes.pdf");
        assert_eq!(body["stages"][1], "package_artifact");
        assert_eq!(body["config"]["card_density"], "medium");

        let body = serde_json::to_value(SubmitJob::new("a.pdf", "pdfs/a")).unwrap();
        assert!(body.get("stages").is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = JobApiClient::new("http://localhost:8080/");
        assert_eq!(client.url("/jobs"), "http://localhost:8080/jobs");
    }

    #[test]
    fn not_found_is_recognised() {
        let err = ClientError::Api {
            status: 404,
            code: "not_found".into(),
            message: "job not found".into(),
        };
        assert!(err.is_not_found());
        assert!(!ClientError::Transport("refused".into()).is_not_found());
    }
}
