use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use docpipe_jobs::{JobStatusView, JobView};

use crate::app::services::{AppServices, Removal};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job).delete(delete_job))
        .route("/:id/status", get(get_job_status))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    let job = match services.create_job(body.input, body.config, body.stages).await {
        Ok(job) => job,
        Err(e) => return errors::service_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(dto::CreateJobResponse {
            job_id: job.id(),
            status: job.status(),
        }),
    )
        .into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<dto::ListJobsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => return errors::query_rejection(e),
    };
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match services.list_jobs(filter).await {
        Ok(page) => (StatusCode::OK, Json(dto::JobListResponse::from(page))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.stats().await {
        Ok((jobs, queue)) => (StatusCode::OK, Json(dto::StatsResponse::new(jobs, queue))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.get_job(id).await {
        Ok(job) => (StatusCode::OK, Json(JobView::from(&job))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Lightweight projection for pollers.
pub async fn get_job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.get_job(id).await {
        Ok(job) => (StatusCode::OK, Json(JobStatusView::from(&job))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.cancel_job(id).await {
        Ok((accepted, job)) => (
            StatusCode::OK,
            Json(dto::CancelJobResponse {
                job_id: job.id(),
                accepted,
                status: job.status(),
                cancel_requested: job.cancel_requested(),
            }),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.retry_job(id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(JobStatusView::from(&job))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.delete_job(id).await {
        Ok(Removal::Deleted | Removal::CancelRequested) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
