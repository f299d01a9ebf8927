//! Work queue delivering job ids to workers.
//!
//! ## Design
//!
//! - At-least-once delivery: a leased entry becomes visible again when its
//!   visibility timeout lapses without an `ack`
//! - One live entry per job id; enqueueing an id that is already queued is a no-op,
//!   except that a leased entry is redelivered after its holder acks it
//! - Entries whose lease lapses more than `max_deliveries` times are dead-lettered
//! - The queue carries ids only; the job store stays the source of truth

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use docpipe_core::{JobId, WorkerId};

pub mod in_memory;

pub use in_memory::InMemoryJobQueue;

/// A leased queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    /// How many times this entry has been handed out, including this one.
    pub deliveries: u32,
    pub visible_again_at: DateTime<Utc>,
}

/// A job id that will not be delivered again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub reason: String,
    pub deliveries: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue sizes by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// Queue behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Lapsed leases tolerated before an entry is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_deliveries: 10 }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} is not leased")]
    NotLeased(JobId),
    #[error("job {job_id} is leased by another worker")]
    LeasedByOther { job_id: JobId },
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make `job_id` available for delivery. Removes it from the dead-letter set.
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Hand the oldest visible entry to `worker`, hidden for `visibility_timeout`.
    async fn lease(
        &self,
        worker: WorkerId,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Push the visibility timeout of a held entry forward.
    async fn extend_lease(
        &self,
        job_id: JobId,
        worker: WorkerId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Remove the entry for good, unless it was enqueued again while leased.
    async fn ack(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Drop every trace of `job_id`, dead letter included. Used when the job
    /// itself is deleted.
    async fn forget(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Release a leased entry so it becomes visible after `requeue_delay`.
    async fn nack(&self, job_id: JobId, requeue_delay: Duration) -> Result<(), QueueError>;

    /// Drop the entry and record it in the dead-letter set. An entry enqueued
    /// again while leased is made ready instead.
    async fn dead_letter(&self, job_id: JobId, reason: String) -> Result<(), QueueError>;

    /// Dead-lettered entries, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, QueueError> {
    let delay = chrono::Duration::from_std(delay).map_err(|e| QueueError::InvalidDuration(e.to_string()))?;
    now.checked_add_signed(delay)
        .ok_or_else(|| QueueError::InvalidDuration(format!("{delay} from {now} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_rejects_deadlines_past_the_calendar() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(30)).unwrap(), now + chrono::Duration::seconds(30));

        let a_million_years = Duration::from_secs(1_000_000 * 365 * 24 * 60 * 60);
        assert!(matches!(after(now, a_million_years), Err(QueueError::InvalidDuration(_))));
        assert!(matches!(after(now, Duration::MAX), Err(QueueError::InvalidDuration(_))));
    }
}
