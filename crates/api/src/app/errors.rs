use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use docpipe_core::{DomainError, JobId};
use docpipe_infra::jobs::JobStoreError;

use crate::app::services::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Store(e) => store_error_to_response(e),
        ServiceError::Queue(e) => {
            error!(error = %e, "queue operation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", "queue unavailable")
        }
        ServiceError::InvalidState(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        e @ JobStoreError::Conflict { .. } => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        JobStoreError::Rejected(e) => json_error(StatusCode::CONFLICT, "invalid_state", e.to_string()),
        JobStoreError::Invalid(e) => domain_error_to_response(e),
        JobStoreError::Storage(msg) => {
            error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "storage unavailable")
        }
    }
}

fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        err @ DomainError::VersionMismatch { .. } => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Malformed query strings get the same body as every other failure.
pub fn query_rejection(rejection: QueryRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_jobs::{JobError, JobStatus};

    #[test]
    fn store_errors_map_to_statuses() {
        let id = JobId::new();
        let cases = [
            (JobStoreError::NotFound(id), StatusCode::NOT_FOUND),
            (
                JobStoreError::Conflict {
                    id,
                    expected: docpipe_core::ExpectedVersion::Exact(1),
                    actual: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                JobStoreError::Rejected(JobError::InvalidTransition {
                    from: JobStatus::Completed,
                    to: JobStatus::Processing,
                }),
                StatusCode::CONFLICT,
            ),
            (
                JobStoreError::Invalid(DomainError::validation("bad")),
                StatusCode::BAD_REQUEST,
            ),
            (
                JobStoreError::Storage("connection reset".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(store_error_to_response(err).status(), status);
        }
    }

    #[test]
    fn malformed_id_is_bad_request() {
        assert_eq!(
            parse_job_id("not-a-uuid").unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert!(parse_job_id(&JobId::new().to_string()).is_ok());
    }
}
