use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::{dto, errors, services::AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Queue entries that will not be delivered again.
pub async fn dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<dto::DeadLettersQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => return errors::query_rejection(e),
    };

    match services.dead_letters(query.limit()).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
