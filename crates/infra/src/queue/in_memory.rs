//! In-memory work queue for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use docpipe_core::{JobId, WorkerId};

use super::{after, DeadLetterEntry, Delivery, JobQueue, QueueConfig, QueueDepth, QueueError};

#[derive(Debug, Clone, Copy)]
enum EntryState {
    Ready { visible_at: DateTime<Utc> },
    Leased { worker: WorkerId, expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    enqueued_at: DateTime<Utc>,
    deliveries: u32,
    /// Leases that lapsed without an ack or nack.
    expired_leases: u32,
    /// Enqueued again while leased; the holder's ack makes it ready instead
    /// of removing it.
    requeued: bool,
}

impl Entry {
    /// When the entry can next be handed out, if it can be handed out now.
    fn available_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.state {
            EntryState::Ready { visible_at } if visible_at <= now => Some(visible_at),
            EntryState::Leased { expires_at, .. } if expires_at <= now => Some(expires_at),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<JobId, Entry>,
    dead: HashMap<JobId, DeadLetterEntry>,
}

impl QueueState {
    /// Make a leased entry that was enqueued again ready for delivery.
    fn release_requeued(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(&job_id) {
            Some(entry) if entry.requeued => {
                entry.state = EntryState::Ready { visible_at: now };
                entry.requeued = false;
                entry.expired_leases = 0;
                true
            }
            _ => false,
        }
    }
}

/// In-memory [`JobQueue`].
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state()?;
        state.dead.remove(&job_id);
        let entry = state.entries.entry(job_id).or_insert(Entry {
            state: EntryState::Ready { visible_at: now },
            enqueued_at: now,
            deliveries: 0,
            expired_leases: 0,
            requeued: false,
        });
        if matches!(entry.state, EntryState::Leased { .. }) {
            entry.requeued = true;
        }
        Ok(())
    }

    async fn lease(
        &self,
        worker: WorkerId,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let expires_at = after(now, visibility_timeout)?;
        let mut state = self.state()?;

        loop {
            let next = state
                .entries
                .iter()
                .filter_map(|(id, entry)| {
                    entry
                        .available_since(now)
                        .map(|since| (since, entry.enqueued_at, *id))
                })
                .min();
            let Some((_, _, job_id)) = next else {
                return Ok(None);
            };

            let Some(entry) = state.entries.get_mut(&job_id) else {
                continue;
            };
            if matches!(entry.state, EntryState::Leased { .. }) {
                entry.expired_leases += 1;
            }

            if entry.expired_leases > self.config.max_deliveries {
                let deliveries = entry.deliveries;
                let expired = entry.expired_leases;
                state.entries.remove(&job_id);
                warn!(job_id = %job_id, deliveries, expired, "lease expired too often, dead-lettering");
                state.dead.insert(
                    job_id,
                    DeadLetterEntry {
                        job_id,
                        reason: format!("lease expired {expired} times without acknowledgement"),
                        deliveries,
                        dead_lettered_at: now,
                    },
                );
                continue;
            }

            entry.deliveries += 1;
            entry.state = EntryState::Leased { worker, expires_at };
            return Ok(Some(Delivery {
                job_id,
                worker_id: worker,
                deliveries: entry.deliveries,
                visible_again_at: expires_at,
            }));
        }
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker: WorkerId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        let expires_at = after(Utc::now(), visibility_timeout)?;
        let mut state = self.state()?;
        let entry = state
            .entries
            .get_mut(&job_id)
            .ok_or(QueueError::NotLeased(job_id))?;

        match entry.state {
            EntryState::Leased { worker: holder, .. } if holder == worker => {
                entry.state = EntryState::Leased { worker, expires_at };
                Ok(())
            }
            EntryState::Leased { .. } => Err(QueueError::LeasedByOther { job_id }),
            EntryState::Ready { .. } => Err(QueueError::NotLeased(job_id)),
        }
    }

    async fn ack(&self, job_id: JobId) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state()?;
        if !state.release_requeued(job_id, now) {
            state.entries.remove(&job_id);
        }
        Ok(())
    }

    async fn forget(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut state = self.state()?;
        state.entries.remove(&job_id);
        state.dead.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: JobId, requeue_delay: Duration) -> Result<(), QueueError> {
        let visible_at = after(Utc::now(), requeue_delay)?;
        let mut state = self.state()?;
        let entry = state
            .entries
            .get_mut(&job_id)
            .ok_or(QueueError::NotLeased(job_id))?;
        entry.state = EntryState::Ready { visible_at };
        entry.requeued = false;
        Ok(())
    }

    async fn dead_letter(&self, job_id: JobId, reason: String) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.state()?;
        if state.release_requeued(job_id, now) {
            return Ok(());
        }
        let deliveries = state
            .entries
            .remove(&job_id)
            .map(|e| e.deliveries)
            .unwrap_or_default();
        state.dead.insert(
            job_id,
            DeadLetterEntry {
                job_id,
                reason,
                deliveries,
                dead_lettered_at: now,
            },
        );
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state()?;
        let mut entries: Vec<_> = state.dead.values().cloned().collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Utc::now();
        let state = self.state()?;
        let mut depth = QueueDepth {
            dead_lettered: state.dead.len(),
            ..QueueDepth::default()
        };
        for entry in state.entries.values() {
            match entry.state {
                EntryState::Leased { expires_at, .. } if expires_at > now => depth.in_flight += 1,
                _ => depth.ready += 1,
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn lease_hands_out_each_entry_once() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();

        let delivery = queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, job_id);
        assert_eq!(delivery.deliveries, 1);
        assert!(queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_job() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.enqueue(job_id).await.unwrap();

        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn entries_are_delivered_in_enqueue_order() {
        let queue = InMemoryJobQueue::default();
        let first = JobId::new();
        let second = JobId::new();
        queue.enqueue(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        queue.enqueue(second).await.unwrap();

        let worker = WorkerId::new();
        assert_eq!(queue.lease(worker, VISIBILITY).await.unwrap().unwrap().job_id, first);
        assert_eq!(queue.lease(worker, VISIBILITY).await.unwrap().unwrap().job_id, second);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();

        queue
            .lease(WorkerId::new(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let again = queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.job_id, job_id);
        assert_eq!(again.deliveries, 2);
    }

    #[tokio::test]
    async fn extend_lease_requires_holder() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        let holder = WorkerId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.lease(holder, VISIBILITY).await.unwrap().unwrap();

        queue.extend_lease(job_id, holder, VISIBILITY).await.unwrap();
        let err = queue
            .extend_lease(job_id, WorkerId::new(), VISIBILITY)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeasedByOther { .. }));
    }

    #[tokio::test]
    async fn ack_removes_entry() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        queue.ack(job_id).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn forget_clears_the_dead_letter_too() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        queue.dead_letter(job_id, "retries exhausted".into()).await.unwrap();

        queue.ack(job_id).await.unwrap();
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);

        queue.forget(job_id).await.unwrap();
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn enqueue_while_leased_survives_the_ack() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();

        queue.enqueue(job_id).await.unwrap();
        queue.ack(job_id).await.unwrap();

        let delivery = queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, job_id);
        queue.ack(job_id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn nack_delays_redelivery() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();

        queue.nack(job_id, Duration::from_secs(60)).await.unwrap();
        assert!(queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().is_none());

        queue.nack(job_id, Duration::ZERO).await.unwrap();
        let delivery = queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        assert_eq!(delivery.deliveries, 2);
    }

    #[tokio::test]
    async fn repeatedly_expiring_entry_is_dead_lettered() {
        let queue = InMemoryJobQueue::new(QueueConfig { max_deliveries: 1 });
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();

        let short = Duration::from_millis(5);
        queue.lease(WorkerId::new(), short).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.lease(WorkerId::new(), short).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(queue.lease(WorkerId::new(), short).await.unwrap().is_none());
        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, job_id);
        assert_eq!(dead[0].deliveries, 2);
    }

    #[tokio::test]
    async fn dead_letter_then_enqueue_revives_entry() {
        let queue = InMemoryJobQueue::default();
        let job_id = JobId::new();
        queue.enqueue(job_id).await.unwrap();
        queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().unwrap();
        queue
            .dead_letter(job_id, "stage failed after 3 retries".to_string())
            .await
            .unwrap();

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.dead_lettered, 1);
        assert_eq!(depth.ready + depth.in_flight, 0);

        queue.enqueue(job_id).await.unwrap();
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
        assert!(queue.lease(WorkerId::new(), VISIBILITY).await.unwrap().is_some());
    }
}
