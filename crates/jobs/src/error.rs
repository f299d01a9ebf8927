use chrono::{DateTime, Utc};
use thiserror::Error;

use docpipe_core::WorkerId;

use crate::status::{JobStatus, StageStatus};

/// A mutation the job state machine refuses to perform.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("invalid transition for stage {index}: {from} -> {to}")]
    InvalidStageTransition {
        index: usize,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("stage {index} out of range (job has {len} stages)")]
    StageOutOfRange { index: usize, len: usize },

    #[error("stage {index} cannot start before stage {blocking} completes")]
    StageOrder { index: usize, blocking: usize },

    #[error("job is leased by worker {owner} until {expires_at}")]
    LeaseHeld {
        owner: WorkerId,
        expires_at: DateTime<Utc>,
    },

    #[error("retry limit reached ({max_retries})")]
    RetriesExhausted { max_retries: u32 },

    #[error("job is not processing (status: {0})")]
    NotProcessing(JobStatus),

    #[error("validation failed: {0}")]
    Validation(String),
}
