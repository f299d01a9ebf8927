//! Job and stage status enums with their allowed transitions.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use docpipe_core::DomainError;

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a worker.
    Pending,
    /// Claimed at least once; stages are running or the job awaits redelivery.
    Processing,
    /// Every stage completed; `result_reference` is set.
    Completed,
    /// Stopped on an error. Resumable through an explicit retry while
    /// `retry_count < max_retries`.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Terminal from the point of view of a polling client.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Terminal once reached: no transition ever leaves these.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// `Processing -> Processing` is a requeue after a transient failure;
    /// `Failed -> Processing` is an explicit retry.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Processing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == lower)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Status of a single stage record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    /// Forward-only. `Processing -> Processing` re-enters a stage whose
    /// previous owner lost its lease; `Failed -> Processing` starts the next
    /// attempt on resume.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_statuses_have_no_outgoing_transitions() {
        for from in [JobStatus::Completed, JobStatus::Cancelled] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn failed_only_resumes_into_processing() {
        for to in JobStatus::ALL {
            assert_eq!(
                JobStatus::Failed.can_transition_to(to),
                to == JobStatus::Processing
            );
        }
    }

    #[test]
    fn completed_stage_never_moves() {
        use StageStatus::*;
        for to in [Pending, Processing, Completed, Failed] {
            assert!(!Completed.can_transition_to(to));
        }
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert!("running".parse::<JobStatus>().is_err());
    }
}
