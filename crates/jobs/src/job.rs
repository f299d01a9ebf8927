//! The Job aggregate.
//!
//! A job owns one ordered stage list fixed at creation. All mutation goes
//! through the methods below; each successful mutation bumps `version`, which
//! stores use as the compare-and-swap token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use docpipe_core::{DomainError, DomainResult, JobId, WorkerId};

use crate::config::{JobConfig, JobInput};
use crate::error::JobError;
use crate::status::{JobStatus, StageStatus};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One entry of the job's ordered stage list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub index: usize,
    pub name: String,
    pub status: StageStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Persisted stage output, reused as the next stage's input on resume.
    pub output: Option<JsonValue>,
    /// Number of times the stage has been entered.
    pub attempts: u32,
}

impl StageRecord {
    fn new(index: usize, name: String) -> Self {
        Self {
            index,
            name,
            status: StageStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
            output: None,
            attempts: 0,
        }
    }
}

/// Exclusive processing rights held by one worker until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Per-stage mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePatch {
    /// Mark the stage `processing`.
    Start,
    /// Mark the stage `completed` and persist its output.
    Complete { output: JsonValue },
    /// Mark the stage `failed` with a message.
    Fail { error: String },
}

impl StagePatch {
    fn target(&self) -> StageStatus {
        match self {
            StagePatch::Start => StageStatus::Processing,
            StagePatch::Complete { .. } => StageStatus::Completed,
            StagePatch::Fail { .. } => StageStatus::Failed,
        }
    }
}

/// Extra fields written together with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub error_message: Option<String>,
    pub result_reference: Option<JsonValue>,
}

impl TransitionFields {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn result(reference: JsonValue) -> Self {
        Self {
            result_reference: Some(reference),
            ..Default::default()
        }
    }
}

/// What a cancellation request did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No worker held the job; it is now `cancelled`.
    Cancelled,
    /// A worker holds the job; the flag is honoured at the next stage boundary.
    Flagged,
    /// The job was already terminal (or failed); nothing changed.
    Ignored,
}

impl CancelOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, CancelOutcome::Ignored)
    }
}

/// Durable record of one document's progress through the staged pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    status: JobStatus,
    input: JobInput,
    config: JobConfig,
    stages: Vec<StageRecord>,
    current_stage_index: usize,
    progress: u8,
    retry_count: u32,
    max_retries: u32,
    version: u64,
    cancel_requested: bool,
    lease: Option<Lease>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result_reference: Option<JsonValue>,
}

impl Job {
    /// Create a `pending` job with a fixed stage list.
    ///
    /// `default_max_retries` applies unless the config overrides it.
    pub fn new(
        id: JobId,
        input: JobInput,
        config: JobConfig,
        stage_names: Vec<String>,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        input.validate()?;
        config.validate()?;

        if stage_names.is_empty() {
            return Err(DomainError::validation("a job needs at least one stage"));
        }
        if let Some(blank) = stage_names.iter().position(|n| n.trim().is_empty()) {
            return Err(DomainError::validation(format!("stage {blank} has an empty name")));
        }

        let stages = stage_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| StageRecord::new(index, name))
            .collect();

        Ok(Self {
            id,
            status: JobStatus::Pending,
            max_retries: config.max_retries.unwrap_or(default_max_retries),
            input,
            config,
            stages,
            current_stage_index: 0,
            progress: 0,
            retry_count: 0,
            version: 0,
            cancel_requested: false,
            lease: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_reference: None,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn input(&self) -> &JobInput {
        &self.input
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&StageRecord> {
        self.stages.get(index)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage_index
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn result_reference(&self) -> Option<&JsonValue> {
        self.result_reference.as_ref()
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }

    /// Index of the first stage that has not completed; `None` when all have.
    pub fn first_incomplete_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.status != StageStatus::Completed)
    }

    pub fn remaining_stages(&self) -> usize {
        self.stage_count() - self.completed_stages()
    }

    /// Input for stage `index`: the job input for stage 0, otherwise the
    /// persisted output of the previous stage.
    pub fn stage_input(&self, index: usize) -> Option<JsonValue> {
        if index == 0 {
            return serde_json::to_value(&self.input).ok();
        }
        self.stages.get(index - 1).and_then(|s| s.output.clone())
    }

    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|l| l.is_active(now))
    }

    pub fn is_leased_by(&self, worker: WorkerId, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|l| l.owner == worker && l.is_active(now))
    }

    /// Whether the job API may resume this job.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Acquire exclusive processing rights.
    ///
    /// Allowed on `pending` and `processing` jobs whose lease is absent,
    /// expired, or already held by `worker`. Execution resumes at the first
    /// non-completed stage.
    pub fn claim(
        &mut self,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {}
            other => {
                return Err(JobError::InvalidTransition {
                    from: other,
                    to: JobStatus::Processing,
                });
            }
        }

        if let Some(lease) = self.lease {
            if lease.is_active(now) && lease.owner != worker {
                return Err(JobError::LeaseHeld {
                    owner: lease.owner,
                    expires_at: lease.expires_at,
                });
            }
        }

        self.status = JobStatus::Processing;
        self.started_at.get_or_insert(now);
        self.lease = Some(Lease {
            owner: worker,
            expires_at: lease_until,
        });
        self.current_stage_index = self.first_incomplete_stage().unwrap_or(self.stage_count());
        self.touch(now);
        Ok(())
    }

    /// Apply a stage status change.
    pub fn apply_stage_patch(
        &mut self,
        index: usize,
        patch: StagePatch,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        if self.status != JobStatus::Processing {
            return Err(JobError::NotProcessing(self.status));
        }
        let len = self.stages.len();
        let from = self
            .stages
            .get(index)
            .map(|s| s.status)
            .ok_or(JobError::StageOutOfRange { index, len })?;

        let to = patch.target();
        if !from.can_transition_to(to) {
            return Err(JobError::InvalidStageTransition { index, from, to });
        }

        if to == StageStatus::Processing {
            if let Some(blocking) = self.stages[..index]
                .iter()
                .position(|s| s.status != StageStatus::Completed)
            {
                return Err(JobError::StageOrder { index, blocking });
            }
        }

        let stage = &mut self.stages[index];
        stage.status = to;
        match patch {
            StagePatch::Start => {
                stage.started_at = Some(now);
                stage.completed_at = None;
                stage.error = None;
                stage.attempts += 1;
                self.current_stage_index = index;
            }
            StagePatch::Complete { output } => {
                stage.completed_at = Some(now);
                stage.output = Some(output);
                stage.error = None;
                self.current_stage_index = index + 1;
                self.recompute_progress();
            }
            StagePatch::Fail { error } => {
                stage.completed_at = Some(now);
                stage.error = Some(error);
            }
        }

        self.touch(now);
        Ok(())
    }

    /// Move the job to `next`, writing `fields` alongside. Every transition
    /// releases the lease.
    pub fn apply_transition(
        &mut self,
        next: JobStatus,
        fields: TransitionFields,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(JobError::InvalidTransition { from, to: next });
        }

        match (from, next) {
            // Pending jobs enter processing through `claim`.
            (JobStatus::Pending, JobStatus::Processing) => {
                return Err(JobError::InvalidTransition { from, to: next });
            }
            (JobStatus::Processing, JobStatus::Processing) | (JobStatus::Failed, JobStatus::Processing) => {
                if self.retry_count >= self.max_retries {
                    return Err(JobError::RetriesExhausted {
                        max_retries: self.max_retries,
                    });
                }
                self.retry_count += 1;
                if from == JobStatus::Failed {
                    self.error_message = None;
                    self.completed_at = None;
                    self.cancel_requested = false;
                }
                self.current_stage_index = self.first_incomplete_stage().unwrap_or(self.stage_count());
            }
            (_, JobStatus::Completed) => {
                if let Some(index) = self.first_incomplete_stage() {
                    return Err(JobError::Validation(format!(
                        "cannot complete job: stage {index} has not completed"
                    )));
                }
                self.progress = 100;
                self.completed_at = Some(now);
                self.result_reference = fields.result_reference;
            }
            (_, JobStatus::Failed) => {
                self.error_message = Some(
                    fields
                        .error_message
                        .unwrap_or_else(|| "job failed".to_string()),
                );
                self.completed_at = Some(now);
            }
            (_, JobStatus::Cancelled) => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        self.status = next;
        self.lease = None;
        self.touch(now);
        Ok(())
    }

    /// Request cooperative cancellation.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed => CancelOutcome::Ignored,
            JobStatus::Pending | JobStatus::Processing if !self.lease_active(now) => {
                self.status = JobStatus::Cancelled;
                self.cancel_requested = true;
                self.completed_at = Some(now);
                self.lease = None;
                self.touch(now);
                CancelOutcome::Cancelled
            }
            JobStatus::Pending | JobStatus::Processing => {
                if !self.cancel_requested {
                    self.cancel_requested = true;
                    self.touch(now);
                }
                CancelOutcome::Flagged
            }
        }
    }

    /// Extend the caller's own lease.
    pub fn renew_lease(
        &mut self,
        worker: WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        match self.lease {
            Some(lease) if lease.owner == worker => {
                self.lease = Some(Lease {
                    owner: worker,
                    expires_at: lease_until,
                });
                self.touch(now);
                Ok(())
            }
            Some(lease) => Err(JobError::LeaseHeld {
                owner: lease.owner,
                expires_at: lease.expires_at,
            }),
            None => Err(JobError::NotProcessing(self.status)),
        }
    }

    fn recompute_progress(&mut self) {
        let total = self.stages.len().max(1);
        let derived = (self.completed_stages() * 100 / total) as u8;
        // Monotonic while not terminal.
        self.progress = self.progress.max(derived);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("stage_{i}")).collect()
    }

    fn test_job(stage_count: usize) -> Job {
        Job::new(
            JobId::new(),
            JobInput::new("notes.pdf", "pdfs/notes.pdf"),
            JobConfig::default(),
            names(stage_count),
            DEFAULT_MAX_RETRIES,
            Utc::now(),
        )
        .unwrap()
    }

    fn claimed(stage_count: usize) -> (Job, WorkerId) {
        let mut job = test_job(stage_count);
        let worker = WorkerId::new();
        let now = Utc::now();
        job.claim(worker, now + Duration::seconds(60), now).unwrap();
        (job, worker)
    }

    fn complete_stage(job: &mut Job, index: usize) {
        let now = Utc::now();
        job.apply_stage_patch(index, StagePatch::Start, now).unwrap();
        job.apply_stage_patch(
            index,
            StagePatch::Complete {
                output: serde_json::json!({ "stage": index }),
            },
            now,
        )
        .unwrap();
    }

    #[test]
    fn new_job_is_pending_with_fixed_stages() {
        let job = test_job(3);
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.stage_count(), 3);
        assert_eq!(job.version(), 0);
        assert_eq!(job.max_retries(), DEFAULT_MAX_RETRIES);
        assert!(job.stages().iter().all(|s| s.status == StageStatus::Pending));
    }

    #[test]
    fn job_without_stages_is_rejected() {
        let err = Job::new(
            JobId::new(),
            JobInput::new("a.pdf", "pdfs/a"),
            JobConfig::default(),
            vec![],
            3,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn config_overrides_max_retries() {
        let job = Job::new(
            JobId::new(),
            JobInput::new("a.pdf", "pdfs/a"),
            JobConfig {
                max_retries: Some(1),
                ..Default::default()
            },
            names(2),
            3,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.max_retries(), 1);
    }

    #[test]
    fn claim_sets_lease_and_bumps_version() {
        let (job, worker) = claimed(2);
        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.version(), 1);
        assert!(job.is_leased_by(worker, Utc::now()));
        assert!(job.started_at().is_some());
    }

    #[test]
    fn claim_is_refused_while_another_worker_holds_the_lease() {
        let (mut job, owner) = claimed(2);
        let now = Utc::now();
        let err = job
            .claim(WorkerId::new(), now + Duration::seconds(60), now)
            .unwrap_err();
        assert!(matches!(err, JobError::LeaseHeld { owner: o, .. } if o == owner));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let mut job = test_job(2);
        let now = Utc::now();
        job.claim(WorkerId::new(), now - Duration::seconds(1), now - Duration::seconds(61))
            .unwrap();
        let other = WorkerId::new();
        job.claim(other, now + Duration::seconds(60), now).unwrap();
        assert!(job.is_leased_by(other, now));
    }

    #[test]
    fn stages_run_strictly_in_order() {
        let (mut job, _) = claimed(3);
        let err = job
            .apply_stage_patch(1, StagePatch::Start, Utc::now())
            .unwrap_err();
        assert_eq!(err, JobError::StageOrder { index: 1, blocking: 0 });
    }

    #[test]
    fn completed_stage_cannot_restart() {
        let (mut job, _) = claimed(2);
        complete_stage(&mut job, 0);
        let err = job
            .apply_stage_patch(0, StagePatch::Start, Utc::now())
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidStageTransition { index: 0, .. }));
    }

    #[test]
    fn progress_tracks_completed_stages() {
        let (mut job, _) = claimed(4);
        complete_stage(&mut job, 0);
        assert_eq!(job.progress(), 25);
        complete_stage(&mut job, 1);
        assert_eq!(job.progress(), 50);
        assert_eq!(job.current_stage_index(), 2);
    }

    #[test]
    fn stage_input_chains_previous_output() {
        let (mut job, _) = claimed(2);
        let first = job.stage_input(0).unwrap();
        assert_eq!(first["source_filename"], "notes.pdf");
        complete_stage(&mut job, 0);
        assert_eq!(job.stage_input(1), Some(serde_json::json!({ "stage": 0 })));
    }

    #[test]
    fn completion_requires_every_stage() {
        let (mut job, _) = claimed(2);
        complete_stage(&mut job, 0);
        let err = job
            .apply_transition(JobStatus::Completed, TransitionFields::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));

        complete_stage(&mut job, 1);
        job.apply_transition(
            JobStatus::Completed,
            TransitionFields::result(serde_json::json!({ "artifact": "deck.apkg" })),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.progress(), 100);
        assert!(job.lease().is_none());
        assert!(job.completed_at().is_some());
        assert!(job.result_reference().is_some());
    }

    #[test]
    fn requeue_consumes_retry_and_releases_lease() {
        let (mut job, _) = claimed(2);
        job.apply_stage_patch(0, StagePatch::Start, Utc::now()).unwrap();
        job.apply_stage_patch(0, StagePatch::Fail { error: "timeout".into() }, Utc::now())
            .unwrap();
        job.apply_transition(JobStatus::Processing, TransitionFields::default(), Utc::now())
            .unwrap();
        assert_eq!(job.retry_count(), 1);
        assert!(job.lease().is_none());
        assert_eq!(job.status(), JobStatus::Processing);
    }

    #[test]
    fn retry_resumes_from_first_incomplete_stage() {
        let (mut job, _) = claimed(3);
        complete_stage(&mut job, 0);
        job.apply_stage_patch(1, StagePatch::Start, Utc::now()).unwrap();
        job.apply_stage_patch(1, StagePatch::Fail { error: "bad".into() }, Utc::now())
            .unwrap();
        job.apply_transition(JobStatus::Failed, TransitionFields::error("bad"), Utc::now())
            .unwrap();
        assert_eq!(job.error_message(), Some("bad"));
        assert!(job.completed_at().is_some());
        assert!(job.can_retry());

        job.apply_transition(JobStatus::Processing, TransitionFields::default(), Utc::now())
            .unwrap();
        assert_eq!(job.current_stage_index(), 1);
        assert_eq!(job.retry_count(), 1);
        assert!(job.error_message().is_none());
        assert!(job.completed_at().is_none());
        assert_eq!(job.stage(0).unwrap().status, StageStatus::Completed);
    }

    #[test]
    fn retry_is_refused_once_exhausted() {
        let mut job = Job::new(
            JobId::new(),
            JobInput::new("a.pdf", "pdfs/a"),
            JobConfig::default(),
            names(1),
            0,
            Utc::now(),
        )
        .unwrap();
        let now = Utc::now();
        job.claim(WorkerId::new(), now + Duration::seconds(30), now).unwrap();
        job.apply_transition(JobStatus::Failed, TransitionFields::error("boom"), now)
            .unwrap();
        assert_eq!(job.completed_at(), Some(now));
        assert!(!job.can_retry());
        let err = job
            .apply_transition(JobStatus::Processing, TransitionFields::default(), now)
            .unwrap_err();
        assert_eq!(err, JobError::RetriesExhausted { max_retries: 0 });
    }

    #[test]
    fn cancel_without_lease_is_immediate() {
        let mut job = test_job(2);
        assert_eq!(job.request_cancel(Utc::now()), CancelOutcome::Cancelled);
        assert_eq!(job.status(), JobStatus::Cancelled);
    }

    #[test]
    fn cancel_with_active_lease_only_flags() {
        let (mut job, _) = claimed(2);
        assert_eq!(job.request_cancel(Utc::now()), CancelOutcome::Flagged);
        assert_eq!(job.status(), JobStatus::Processing);
        assert!(job.cancel_requested());
    }

    #[test]
    fn cancel_after_completion_is_ignored() {
        let (mut job, _) = claimed(1);
        complete_stage(&mut job, 0);
        job.apply_transition(JobStatus::Completed, TransitionFields::default(), Utc::now())
            .unwrap();
        let version = job.version();
        assert_eq!(job.request_cancel(Utc::now()), CancelOutcome::Ignored);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.version(), version);
    }

    #[test]
    fn renew_lease_requires_ownership() {
        let (mut job, owner) = claimed(1);
        let later = Utc::now() + Duration::seconds(120);
        assert!(job.renew_lease(WorkerId::new(), later, Utc::now()).is_err());
        job.renew_lease(owner, later, Utc::now()).unwrap();
        assert_eq!(job.lease().unwrap().expires_at, later);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(usize),
        Complete(usize),
        Fail(usize),
        Requeue,
        Claim,
        Cancel,
    }

    fn op_strategy(stages: usize) -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..stages).prop_map(Op::Start),
            (0..stages).prop_map(Op::Complete),
            (0..stages).prop_map(Op::Fail),
            Just(Op::Requeue),
            Just(Op::Claim),
            Just(Op::Cancel),
        ]
    }

    fn apply(job: &mut Job, worker: WorkerId, op: Op) {
        let now = Utc::now();
        let _ = match op {
            Op::Start(i) => job.apply_stage_patch(i, StagePatch::Start, now),
            Op::Complete(i) => job.apply_stage_patch(
                i,
                StagePatch::Complete {
                    output: serde_json::json!(i),
                },
                now,
            ),
            Op::Fail(i) => job.apply_stage_patch(i, StagePatch::Fail { error: "x".into() }, now),
            Op::Requeue => job.apply_transition(JobStatus::Processing, TransitionFields::default(), now),
            Op::Claim => job.claim(worker, now + Duration::seconds(30), now),
            Op::Cancel => {
                job.request_cancel(now);
                Ok(())
            }
        };
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: progress never decreases while the job is not terminal,
        /// and the stage list length never changes.
        #[test]
        fn progress_is_monotonic_and_stage_count_fixed(
            stage_count in 1usize..6,
            ops in prop::collection::vec(op_strategy(5), 1..60),
        ) {
            let mut job = test_job(stage_count);
            let worker = WorkerId::new();
            let mut last_progress = job.progress();

            for op in ops {
                apply(&mut job, worker, op);
                prop_assert_eq!(job.stage_count(), stage_count);
                if !job.status().is_terminal() {
                    prop_assert!(job.progress() >= last_progress);
                }
                last_progress = job.progress();
            }
        }

        /// Property: a completed stage stays completed with its output intact.
        #[test]
        fn completed_stages_never_regress(
            ops in prop::collection::vec(op_strategy(4), 1..60),
        ) {
            let mut job = test_job(4);
            let worker = WorkerId::new();
            let mut completed: Vec<bool> = vec![false; 4];

            for op in ops {
                apply(&mut job, worker, op);
                for (i, stage) in job.stages().iter().enumerate() {
                    if completed[i] {
                        prop_assert_eq!(stage.status, StageStatus::Completed);
                    }
                    completed[i] = stage.status == StageStatus::Completed;
                }
            }
        }

        /// Property: every accepted mutation bumps the version by exactly one.
        #[test]
        fn version_increments_per_mutation(
            ops in prop::collection::vec(op_strategy(3), 1..40),
        ) {
            let mut job = test_job(3);
            let worker = WorkerId::new();
            for op in ops {
                let before = job.clone();
                apply(&mut job, worker, op);
                if job != before {
                    prop_assert_eq!(job.version(), before.version() + 1);
                } else {
                    prop_assert_eq!(job.version(), before.version());
                }
            }
        }
    }
}
