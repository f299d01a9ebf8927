//! HTTP API for submitting and tracking document-processing jobs.

pub mod app;
