//! `docpipe-client`
//!
//! **Responsibility:** typed access to the Job API for callers outside the
//! server process.
//!
//! This crate provides:
//! - `JobApiClient`: one method per Job API endpoint
//! - `Poller`: the adaptive status poller as a pure state machine (`idle` /
//!   `polling`) driven by an injected clock
//! - `spawn_poller`: a tokio driver that runs a `Poller` against a status source

pub mod api;
pub mod driver;
pub mod poller;

pub use api::{CancelResult, ClientError, JobApiClient, JobList, ListJobs, SubmitJob};
pub use driver::{spawn_poller, PollerHandle, PollerSnapshot, StatusSource};
pub use poller::{PollAction, Poller, PollerConfig, PollerState};
