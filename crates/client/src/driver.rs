//! Background task that runs a [`Poller`] against a status source.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use docpipe_core::JobId;
use docpipe_jobs::JobStatusView;

use crate::api::{ClientError, JobApiClient};
use crate::poller::{PollAction, Poller, PollerConfig, PollerState};

/// Where the poller gets job statuses from.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn fetch_status(&self, id: JobId) -> Result<JobStatusView, ClientError>;
}

#[async_trait]
impl StatusSource for JobApiClient {
    async fn fetch_status(&self, id: JobId) -> Result<JobStatusView, ClientError> {
        self.status(id).await
    }
}

/// Latest view of a running poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerSnapshot {
    pub state: PollerState,
    pub last: Option<JobStatusView>,
    pub fetches: u64,
    pub last_error: Option<String>,
}

impl PollerSnapshot {
    fn new() -> Self {
        Self {
            state: PollerState::Idle,
            last: None,
            fetches: 0,
            last_error: None,
        }
    }

    /// Polling stopped after seeing a terminal status.
    pub fn is_finished(&self) -> bool {
        self.state == PollerState::Idle
            && self.last.as_ref().is_some_and(|view| view.status.is_terminal())
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Restart,
    Stop,
    Refresh,
    SetVisible(bool),
}

/// Control surface of a spawned poller. Dropping it ends the task.
#[derive(Debug)]
pub struct PollerHandle {
    commands: mpsc::UnboundedSender<Command>,
    updates: watch::Receiver<PollerSnapshot>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    pub fn restart(&self) {
        self.send(Command::Restart);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub fn set_visible(&self, visible: bool) {
        self.send(Command::SetVisible(visible));
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        self.updates.borrow().clone()
    }

    /// Receiver notified after every event the poller handles.
    pub fn updates(&self) -> watch::Receiver<PollerSnapshot> {
        self.updates.clone()
    }

    /// Wait until polling stops on a terminal status.
    pub async fn finished(&mut self) -> Option<JobStatusView> {
        let snapshot = self
            .updates
            .wait_for(PollerSnapshot::is_finished)
            .await
            .ok()?;
        snapshot.last.clone()
    }

    /// End the background task.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "poller task ended abnormally");
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(?command, "poller task already stopped");
        }
    }
}

/// Start polling `job_id` on the current tokio runtime.
pub fn spawn_poller<S: StatusSource>(source: Arc<S>, job_id: JobId, config: PollerConfig) -> PollerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (updates_tx, updates_rx) = watch::channel(PollerSnapshot::new());

    let task = PollerTask {
        source,
        job_id,
        poller: Poller::new(config),
        snapshot: PollerSnapshot::new(),
        updates: updates_tx,
    };
    let join = tokio::spawn(task.run(commands_rx));

    PollerHandle {
        commands: commands_tx,
        updates: updates_rx,
        join,
    }
}

struct PollerTask<S> {
    source: Arc<S>,
    job_id: JobId,
    poller: Poller,
    snapshot: PollerSnapshot,
    updates: watch::Sender<PollerSnapshot>,
}

impl<S: StatusSource> PollerTask<S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(job_id = %self.job_id, "poller started");
        let action = self.poller.start(Instant::now());
        self.handle(action).await;

        loop {
            let due = self.poller.next_due();
            let action = tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.apply(command)
                }
                _ = sleep_until(due) => self.poller.tick(Instant::now()),
            };
            self.handle(action).await;
        }

        tracing::debug!(job_id = %self.job_id, "poller stopped");
    }

    fn apply(&mut self, command: Command) -> PollAction {
        let now = Instant::now();
        match command {
            Command::Restart => self.poller.restart(now),
            Command::Stop => {
                self.poller.stop();
                PollAction::Wait
            }
            Command::Refresh => self.poller.refresh(),
            Command::SetVisible(visible) => self.poller.set_visible(visible, now),
        }
    }

    async fn handle(&mut self, action: PollAction) {
        if action == PollAction::Fetch {
            self.fetch().await;
        }
        self.snapshot.state = self.poller.state();
        self.updates.send_replace(self.snapshot.clone());
    }

    async fn fetch(&mut self) {
        self.snapshot.fetches += 1;
        match self.source.fetch_status(self.job_id).await {
            Ok(view) => {
                self.poller.observe(view.status);
                tracing::debug!(job_id = %self.job_id, status = %view.status, progress = view.progress, "job status fetched");
                self.snapshot.last = Some(view);
                self.snapshot.last_error = None;
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "job status fetch failed");
                if e.is_not_found() {
                    self.poller.stop();
                }
                self.snapshot.last_error = Some(e.to_string());
            }
        }
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use docpipe_jobs::JobStatus;

    use super::*;

    /// Serves scripted statuses, repeating the last one.
    struct Scripted {
        statuses: Mutex<VecDeque<JobStatus>>,
        fetched: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(statuses: impl IntoIterator<Item = JobStatus>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into_iter().collect()),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn fetches(&self) -> usize {
            self.fetched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn fetch_status(&self, id: JobId) -> Result<JobStatusView, ClientError> {
            self.fetched.lock().unwrap().push(Instant::now());
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                *statuses.front().unwrap()
            };
            Ok(JobStatusView {
                id,
                status,
                progress: 0,
                error_message: None,
                result_reference: None,
            })
        }
    }

    async fn wait_fetches(handle: &PollerHandle, n: u64) {
        handle
            .updates()
            .wait_for(|s| s.fetches >= n)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_terminal_then_goes_quiet() {
        let source = Scripted::new([JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]);
        let started = Instant::now();
        let mut handle = spawn_poller(source.clone(), JobId::new(), PollerConfig::default());

        let last = handle.finished().await.unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(source.fetches(), 3);

        let fetched = source.fetched.lock().unwrap().clone();
        assert_eq!(fetched[0] - started, Duration::ZERO);
        assert_eq!(fetched[2] - started, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetches(), 3);
        assert_eq!(handle.snapshot().state, PollerState::Idle);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_host_skips_scheduled_fetches() {
        let source = Scripted::new([JobStatus::Processing]);
        let handle = spawn_poller(source.clone(), JobId::new(), PollerConfig::default());
        wait_fetches(&handle, 1).await;

        handle.set_visible(false);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(source.fetches(), 1);

        handle.set_visible(true);
        wait_fetches(&handle, 2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.fetches(), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_fetches_once_and_stop_ends_schedule() {
        let source = Scripted::new([JobStatus::Processing]);
        let handle = spawn_poller(source.clone(), JobId::new(), PollerConfig::default());
        wait_fetches(&handle, 1).await;

        handle.refresh();
        wait_fetches(&handle, 2).await;

        handle.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.fetches(), 2);
        assert_eq!(handle.snapshot().state, PollerState::Idle);

        handle.restart();
        wait_fetches(&handle, 3).await;
        assert_eq!(handle.snapshot().state, PollerState::Polling);
        handle.shutdown().await;
    }
}
