//! Staged pipeline execution.
//!
//! ## Components
//!
//! - `Stage`: the plug-in contract each processing step implements
//! - `StageRegistry`: name → implementation lookup and the default stage list
//! - `Orchestrator`: runs a claimed job's remaining stages with timeouts,
//!   retries and cancellation checkpoints
//! - `RetryPolicy`: requeue backoff after transient failures

pub mod builtin;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod stage;

pub use builtin::{learning_pipeline_registry, PackageArtifactStage, PassthroughStage, LEARNING_PIPELINE};
pub use orchestrator::{Orchestrator, PipelineConfig, RunOutcome};
pub use registry::StageRegistry;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use stage::{Stage, StageError, StageErrorKind};
