//! Adaptive job status poller.
//!
//! A pure state machine: callers feed it the current time and events
//! (`start`, `tick`, visibility changes, fetched statuses) and it answers with
//! whether a status fetch should happen now. Timers and HTTP live in
//! [`crate::driver`].

use std::time::Duration;

use tokio::time::Instant;

use docpipe_jobs::JobStatus;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Ceiling for the interval when `backoff` is on.
    pub max_interval: Duration,
    /// Double the interval after every scheduled fetch.
    pub backoff: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            backoff: false,
        }
    }
}

impl PollerConfig {
    pub fn with_backoff(mut self, max_interval: Duration) -> Self {
        self.backoff = true;
        self.max_interval = max_interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
}

/// What the caller should do after feeding the poller an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Fetch the job status now.
    Fetch,
    Wait,
}

#[derive(Debug, Clone)]
pub struct Poller {
    config: PollerConfig,
    state: PollerState,
    interval: Duration,
    next_due: Option<Instant>,
    visible: bool,
}

impl Poller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            state: PollerState::Idle,
            interval: config.interval,
            next_due: None,
            visible: true,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Interval until the next scheduled fetch.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the next scheduled fetch is due, if one is scheduled.
    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// `idle → polling`: fetch immediately, then every `interval`.
    ///
    /// While hidden the immediate fetch waits for visibility to return.
    /// Starting an already polling poller does nothing.
    pub fn start(&mut self, now: Instant) -> PollAction {
        if self.state == PollerState::Polling {
            return PollAction::Wait;
        }
        self.state = PollerState::Polling;
        self.interval = self.config.interval;
        self.next_due = Some(now + self.interval);
        self.fire()
    }

    /// Stop, reset backoff and start again.
    pub fn restart(&mut self, now: Instant) -> PollAction {
        self.stop();
        self.start(now)
    }

    /// Clear the schedule unconditionally.
    pub fn stop(&mut self) {
        self.state = PollerState::Idle;
        self.next_due = None;
    }

    /// A one-off fetch that leaves the schedule alone.
    pub fn refresh(&self) -> PollAction {
        PollAction::Fetch
    }

    /// Advance the clock. Fetches when the scheduled time has come and the
    /// host is visible. While hidden the schedule keeps moving without fetching.
    pub fn tick(&mut self, now: Instant) -> PollAction {
        let Some(due) = self.next_due else {
            return PollAction::Wait;
        };
        if self.state != PollerState::Polling || now < due {
            return PollAction::Wait;
        }

        if self.config.backoff && self.visible {
            self.interval = (self.interval * 2).min(self.config.max_interval);
        }
        self.next_due = Some(now + self.interval);
        self.fire()
    }

    /// The host became visible or hidden. Returning to visible while polling
    /// fetches at once and restarts the schedule from `now`.
    pub fn set_visible(&mut self, visible: bool, now: Instant) -> PollAction {
        if self.visible == visible {
            return PollAction::Wait;
        }
        self.visible = visible;
        if !visible || self.state != PollerState::Polling {
            return PollAction::Wait;
        }

        self.next_due = Some(now + self.interval);
        PollAction::Fetch
    }

    /// Feed a fetched status. Terminal statuses stop the poller.
    pub fn observe(&mut self, status: JobStatus) -> PollerState {
        if status.is_terminal() {
            self.stop();
        }
        self.state
    }

    fn fire(&self) -> PollAction {
        if self.visible {
            PollAction::Fetch
        } else {
            PollAction::Wait
        }
    }
}
