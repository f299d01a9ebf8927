use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

/// Router for every Job API endpoint.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/dead-letters", get(system::dead_letters))
}
