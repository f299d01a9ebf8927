//! Worker pool: leases job ids from the queue, claims the job in the store
//! and hands it to the orchestrator.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docpipe_core::{JobId, WorkerId};
use docpipe_jobs::{Job, JobError};

use crate::jobs::{JobStore, JobStoreError};
use crate::pipeline::{Orchestrator, RunOutcome};
use crate::queue::{Delivery, JobQueue};

/// Claim attempts against a moving version before giving the delivery back.
const MAX_CLAIM_CONFLICTS: u32 = 3;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent workers
    pub workers: usize,
    /// How long an idle worker waits before asking the queue again
    pub poll_interval: Duration,
    /// Minimum lease requested from the queue and the store
    pub lease_timeout: Duration,
    /// How long in-flight jobs may keep running after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "docpipe-workers".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(200),
            lease_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_requeued: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_abandoned: u64,
    pub leases_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct StatsCell(Mutex<WorkerPoolStats>);

impl StatsCell {
    fn update(&self, f: impl FnOnce(&mut WorkerPoolStats)) {
        let mut stats = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    fn snapshot(&self) -> WorkerPoolStats {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<StatsCell>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop leasing new work and wait for every worker to finish. In-flight
    /// jobs get `shutdown_grace` before they are abandoned to lease expiry.
    pub async fn shutdown(self) -> WorkerPoolStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        let mut stats = self.stats.snapshot();
        stats.uptime_secs = self.started.elapsed().as_secs();
        info!(jobs_processed = stats.jobs_processed, jobs_abandoned = stats.jobs_abandoned, "worker pool stopped");
        stats
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let mut stats = self.stats.snapshot();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

enum Claim {
    Claimed { job: Job, lease: Duration },
    /// Nothing to do for this delivery; ack it.
    Skip(&'static str),
    /// Someone else holds the job; make the delivery visible again later.
    Busy(Duration),
}

struct Shared {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    config: WorkerPoolConfig,
    stats: Arc<StatsCell>,
}

/// A fixed set of async workers sharing one queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                queue,
                orchestrator,
                config,
                stats: Arc::new(StatsCell::default()),
            }),
        }
    }

    /// Spawn the workers on the current tokio runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.shared.config.workers.max(1);

        let joins = (0..workers)
            .map(|_| {
                let shared = self.shared.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { shared.worker_loop(WorkerId::new(), shutdown).await })
            })
            .collect();

        info!(pool = %self.shared.config.name, workers, "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats: self.shared.stats.clone(),
            started: Instant::now(),
        }
    }
}

impl Shared {
    async fn worker_loop(&self, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        debug!(pool = %self.config.name, worker_id = %worker, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let keep_going = match self.queue.lease(worker, self.config.lease_timeout).await {
                Ok(Some(delivery)) => {
                    self.process(worker, delivery, shutdown.clone()).await;
                    true
                }
                Ok(None) => idle(self.config.poll_interval, &mut shutdown).await,
                Err(e) => {
                    error!(pool = %self.config.name, worker_id = %worker, error = %e, "queue lease failed");
                    idle(self.config.poll_interval, &mut shutdown).await
                }
            };
            if !keep_going {
                break;
            }
        }

        debug!(pool = %self.config.name, worker_id = %worker, "worker stopped");
    }

    async fn process(&self, worker: WorkerId, delivery: Delivery, shutdown: watch::Receiver<bool>) {
        let job_id = delivery.job_id;

        let (job, lease) = match self.claim(worker, job_id).await {
            Ok(Claim::Claimed { job, lease }) => (job, lease),
            Ok(Claim::Skip(reason)) => {
                debug!(job_id = %job_id, reason, "dropping delivery");
                self.ack(job_id).await;
                return;
            }
            Ok(Claim::Busy(retry_in)) => {
                debug!(job_id = %job_id, retry_in_ms = retry_in.as_millis() as u64, "job is held elsewhere");
                self.nack(job_id, retry_in).await;
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to claim job");
                self.nack(job_id, self.config.poll_interval).await;
                return;
            }
        };

        info!(
            job_id = %job_id,
            worker_id = %worker,
            deliveries = delivery.deliveries,
            retry_count = job.retry_count(),
            resume_stage = job.current_stage_index(),
            "job claimed"
        );

        if let Err(e) = self.queue.extend_lease(job_id, worker, lease).await {
            warn!(job_id = %job_id, error = %e, "could not extend queue lease");
        }
        self.stats.update(|s| s.current_running += 1);

        let heartbeat = tokio::spawn(heartbeat(
            self.queue.clone(),
            self.store.clone(),
            job_id,
            worker,
            lease,
        ));

        let outcome = tokio::select! {
            outcome = self.orchestrator.run(job, worker) => Some(outcome),
            _ = grace_expired(shutdown, self.config.shutdown_grace) => None,
        };
        heartbeat.abort();

        self.stats.update(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
        });

        match outcome {
            None => {
                warn!(job_id = %job_id, "shutdown grace elapsed, abandoning job to lease expiry");
                self.stats.update(|s| s.jobs_abandoned += 1);
            }
            Some(Err(e)) => {
                error!(job_id = %job_id, error = %e, "job store error during orchestration");
                self.nack(job_id, self.config.poll_interval).await;
            }
            Some(Ok(outcome)) => self.settle(job_id, outcome).await,
        }
    }

    /// Translate a run outcome into a queue operation.
    async fn settle(&self, job_id: JobId, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Completed => {
                self.stats.update(|s| s.jobs_completed += 1);
                self.ack(job_id).await;
            }
            RunOutcome::Cancelled => {
                self.stats.update(|s| s.jobs_cancelled += 1);
                self.ack(job_id).await;
            }
            RunOutcome::Failed { error, dead_letter } => {
                self.stats.update(|s| {
                    s.jobs_failed += 1;
                    if dead_letter {
                        s.jobs_dead_lettered += 1;
                    }
                });
                if dead_letter {
                    if let Err(e) = self.queue.dead_letter(job_id, error).await {
                        warn!(job_id = %job_id, error = %e, "dead-letter failed");
                    }
                } else {
                    self.ack(job_id).await;
                }
            }
            RunOutcome::Requeue { delay } => {
                self.stats.update(|s| s.jobs_requeued += 1);
                self.nack(job_id, delay).await;
            }
            // The delivery belongs to whoever holds the job now.
            RunOutcome::LeaseLost => self.stats.update(|s| s.leases_lost += 1),
        }
    }

    async fn claim(&self, worker: WorkerId, job_id: JobId) -> Result<Claim, JobStoreError> {
        let mut conflicts = 0;
        loop {
            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(JobStoreError::NotFound(_)) => return Ok(Claim::Skip("job no longer exists")),
                Err(e) => return Err(e),
            };
            if job.status().is_terminal() {
                return Ok(Claim::Skip("job is no longer runnable"));
            }

            let lease = self.effective_lease(&job);
            match self.store.claim(job_id, job.version(), worker, lease).await {
                Ok(job) => return Ok(Claim::Claimed { job, lease }),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts >= MAX_CLAIM_CONFLICTS {
                        return Ok(Claim::Busy(self.config.poll_interval));
                    }
                }
                Err(JobStoreError::Rejected(JobError::LeaseHeld { expires_at, .. })) => {
                    let retry_in = (expires_at - Utc::now())
                        .to_std()
                        .unwrap_or(self.config.poll_interval);
                    return Ok(Claim::Busy(retry_in));
                }
                Err(JobStoreError::Rejected(_)) => return Ok(Claim::Skip("job cannot be claimed")),
                Err(e) => return Err(e),
            }
        }
    }

    /// Long enough to cover every remaining stage at its timeout.
    fn effective_lease(&self, job: &Job) -> Duration {
        let remaining = u32::try_from(job.remaining_stages()).unwrap_or(u32::MAX);
        let worst_case = self
            .orchestrator
            .config()
            .stage_timeout
            .saturating_mul(remaining.saturating_add(1));
        self.config.lease_timeout.max(worst_case)
    }

    async fn ack(&self, job_id: JobId) {
        if let Err(e) = self.queue.ack(job_id).await {
            warn!(job_id = %job_id, error = %e, "ack failed");
        }
    }

    async fn nack(&self, job_id: JobId, delay: Duration) {
        if let Err(e) = self.queue.nack(job_id, delay).await {
            warn!(job_id = %job_id, error = %e, "nack failed");
        }
    }
}

/// Sleep for `period`, returning `false` as soon as shutdown is requested.
async fn idle(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Resolves `grace` after shutdown is requested; never if it is not.
async fn grace_expired(mut shutdown: watch::Receiver<bool>, grace: Duration) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
    tokio::time::sleep(grace).await;
}

/// Keep both leases alive while the orchestrator works.
async fn heartbeat(
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    job_id: JobId,
    worker: WorkerId,
    lease: Duration,
) {
    let mut ticker = tokio::time::interval((lease / 3).max(Duration::from_millis(10)));
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if let Err(e) = queue.extend_lease(job_id, worker, lease).await {
            warn!(job_id = %job_id, error = %e, "heartbeat could not extend queue lease");
            return;
        }

        match store.get(job_id).await {
            Ok(job) if job.lease().is_some_and(|l| l.owner == worker) => {
                match store.renew_lease(job_id, job.version(), worker, lease).await {
                    Ok(_) => debug!(job_id = %job_id, "lease renewed"),
                    // The orchestrator wrote in between; try again next tick.
                    Err(e) if e.is_conflict() => {}
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "heartbeat could not renew job lease");
                        return;
                    }
                }
            }
            Ok(_) => return,
            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat could not load job"),
        }
    }
}
