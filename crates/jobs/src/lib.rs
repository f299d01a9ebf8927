//! Job domain module.
//!
//! The Job aggregate, its stage records and the lifecycle state machine,
//! implemented as deterministic domain logic (no IO, no runtime, no storage).
//! Stores persist a `Job` and guard every mutation with its `version`.

pub mod config;
pub mod error;
pub mod job;
pub mod status;
pub mod view;

pub use config::{CardDensity, JobConfig, JobInput};
pub use error::JobError;
pub use job::{CancelOutcome, Job, Lease, StagePatch, StageRecord, TransitionFields, DEFAULT_MAX_RETRIES};
pub use status::{JobStatus, StageStatus};
pub use view::{JobStatusView, JobView, StageView};
