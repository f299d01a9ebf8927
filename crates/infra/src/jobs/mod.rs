//! Durable job storage.
//!
//! ## Components
//!
//! - `JobStore`: version-guarded persistence for the `Job` aggregate
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: one JSONB row per job, guarded by a version column

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobFilter, JobPage, JobStats, JobStore, JobStoreError, NewJob};
