//! Flow-run lifecycle tracker.
//!
//! Starts runs on the orchestrator, polls them with geometric backoff until a
//! terminal status, cancels them with a bounded grace window, and resumes an
//! in-flight run from the persisted session after a restart. All effects land
//! in the shared [`SessionStore`], which this tracker is the only writer of.

pub mod backoff;
pub mod deployment;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::orchestrator::{OrchestratorClient, OrchestratorError, RunStatus, timestamp_order};
use crate::session::{LOG_LIMIT, SessionStore};

use self::backoff::Backoff;

pub use self::deployment::DeploymentResolver;

/// Timing knobs for the polling loop.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// How long polls may keep reporting a non-terminal status after a stop
    /// request before the run is abandoned.
    pub grace_window: Duration,
    pub log_limit: usize,
    /// Delete the run record on the orchestrator once it reaches a terminal status.
    pub auto_delete_runs: bool,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(10_000),
            grace_window: Duration::from_secs(12),
            log_limit: LOG_LIMIT,
            auto_delete_runs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(String),
    /// A run is already being tracked; nothing was launched.
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    Finished,
}

/// Handle on the spawned polling task.
struct PollHandle {
    run_id: String,
    cancel: CancellationToken,
    /// Cancelled by the task itself when its loop exits.
    done: CancellationToken,
}

/// Per-loop state handed to the polling task.
struct PollTask {
    run_id: String,
    cancel: CancellationToken,
    /// Set while a tick of this loop is talking to the orchestrator.
    tick_in_flight: AtomicBool,
}

/// Holds the start slot for the duration of a `start` call.
///
/// If the call is dropped before the orchestrator answered, the slot is
/// released and the loading flag cleared so later starts are not refused.
struct StartSlot<'a> {
    tracker: &'a RunTracker,
    pending: bool,
}

impl StartSlot<'_> {
    fn settle(&mut self) {
        self.pending = false;
    }
}

impl Drop for StartSlot<'_> {
    fn drop(&mut self) {
        self.tracker.control().starting = false;
        if self.pending {
            tracing::warn!("start abandoned before the orchestrator answered");
            self.tracker.inner.session.set_loading(false);
        }
    }
}

struct Control {
    poll: Option<PollHandle>,
    starting: bool,
    start_time: Option<Instant>,
    stop_requested_at: Option<Instant>,
    since: Option<String>,
    backoff: Backoff,
}

struct TrackerInner {
    client: Arc<dyn OrchestratorClient>,
    session: Arc<SessionStore>,
    policy: PollPolicy,
    control: Mutex<Control>,
}

#[derive(Clone)]
pub struct RunTracker {
    inner: Arc<TrackerInner>,
}

impl RunTracker {
    pub fn new(client: Arc<dyn OrchestratorClient>, session: Arc<SessionStore>, policy: PollPolicy) -> Self {
        let backoff = Backoff::new(policy.initial_delay, policy.multiplier, policy.max_delay);
        Self {
            inner: Arc::new(TrackerInner {
                client,
                session,
                policy,
                control: Mutex::new(Control {
                    poll: None,
                    starting: false,
                    start_time: None,
                    stop_requested_at: None,
                    since: None,
                    backoff,
                }),
            }),
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.inner.session
    }

    pub fn client(&self) -> &Arc<dyn OrchestratorClient> {
        &self.inner.client
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A polling loop is currently running.
    pub fn is_polling(&self) -> bool {
        self.control()
            .poll
            .as_ref()
            .is_some_and(|p| !p.done.is_cancelled())
    }

    fn is_polling_run(&self, run_id: &str) -> bool {
        self.control()
            .poll
            .as_ref()
            .is_some_and(|p| p.run_id == run_id && !p.done.is_cancelled())
    }

    /// Launch a run of `deployment_id` and begin polling it.
    ///
    /// No-op while another run is in flight. On failure the session ends in
    /// `FAILED` with the error surfaced and no polling loop is started.
    pub async fn start(
        &self,
        deployment_id: &str,
        parameters: serde_json::Value,
    ) -> Result<StartOutcome, OrchestratorError> {
        {
            let mut control = self.control();
            let polling = control.poll.as_ref().is_some_and(|p| !p.done.is_cancelled());
            if control.starting || polling || self.inner.session.snapshot().run.is_in_flight() {
                tracing::info!(deployment_id, "run already active, ignoring start");
                return Ok(StartOutcome::AlreadyActive);
            }
            control.starting = true;
        }
        let mut slot = StartSlot {
            tracker: self,
            pending: true,
        };

        self.cancel_poll();
        self.inner.session.update(|s| {
            s.logs.reset();
            s.loading = true;
            s.error = None;
        });

        let created = self.inner.client.create_run(deployment_id, parameters).await;
        slot.settle();

        let run_id = match created {
            Ok(run_id) => run_id,
            Err(e) => {
                tracing::error!(deployment_id, error = %e, "failed to create flow run");
                self.inner.session.update(|s| {
                    s.run.set_status(RunStatus::Failed);
                    s.error = Some(e.message());
                    s.loading = false;
                });
                return Err(e);
            }
        };

        tracing::info!(deployment_id, run_id = %run_id, "flow run created");
        self.inner.session.update(|s| {
            s.run.set_run_id(Some(run_id.clone()));
            s.run.set_status(RunStatus::Pending);
            s.run.set_runtime(0);
        });

        {
            let mut control = self.control();
            control.start_time = Some(Instant::now());
            control.stop_requested_at = None;
            control.since = None;
            control.backoff.reset();
        }
        self.spawn_poll(run_id.clone());

        Ok(StartOutcome::Started(run_id))
    }

    /// Request cascading cancellation of `run_id`.
    ///
    /// For the tracked run this marks it `STOPPED` locally and keeps polling
    /// until the orchestrator reports a terminal status or the grace window
    /// runs out, whichever comes first.
    pub async fn stop(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let tracked = self.inner.session.snapshot().run.run_id.as_deref() == Some(run_id);
        if tracked {
            self.inner.session.set_loading(true);
        }

        if let Err(e) = self.inner.client.cancel_run_completely(run_id).await {
            tracing::error!(run_id, error = %e, "failed to cancel flow run");
            if tracked {
                self.inner.session.update(|s| {
                    s.error = Some(e.message());
                    s.loading = false;
                });
            }
            return Err(e);
        }

        if !tracked {
            tracing::info!(run_id, "cancelled untracked flow run");
            return Ok(());
        }

        tracing::info!(run_id, "stop requested, waiting for orchestrator to converge");
        {
            let mut control = self.control();
            control.stop_requested_at = Some(Instant::now());
            control.backoff.reset();
        }
        self.inner.session.update(|s| {
            if !s.run.status.is_terminal() {
                s.run.set_status(RunStatus::Stopped);
            }
            s.loading = false;
        });

        if !self.is_polling_run(run_id) {
            self.spawn_poll(run_id.to_string());
        }
        Ok(())
    }

    /// Pick up a run that was in flight when the session was persisted.
    ///
    /// The start time is estimated from the persisted runtime and log fetching
    /// continues from the newest persisted log timestamp. A persisted STOPPED
    /// run re-enters the grace window so polling stays bounded. Returns whether
    /// a polling loop was started.
    pub fn resume(&self) -> bool {
        let snapshot = self.inner.session.snapshot();
        let status = snapshot.run.status;
        let run_id = match snapshot.run.run_id.as_ref() {
            Some(run_id) if !status.is_terminal() && status != RunStatus::NotStarted => run_id.clone(),
            _ => return false,
        };
        if self.is_polling() {
            return false;
        }

        let elapsed = Duration::from_secs(snapshot.run.runtime);
        let now = Instant::now();
        {
            let mut control = self.control();
            control.start_time = Some(now.checked_sub(elapsed).unwrap_or(now));
            control.stop_requested_at = (status == RunStatus::Stopped).then_some(now);
            control.since = snapshot.logs.last_timestamp().map(String::from);
            control.backoff.reset();
        }

        tracing::info!(
            run_id = %run_id,
            status = %snapshot.run.status,
            runtime = snapshot.run.runtime,
            "resuming tracked flow run"
        );
        if status != RunStatus::Stopped {
            self.inner.session.set_loading(true);
        }
        self.spawn_poll(run_id);
        true
    }

    /// Abandon any polling and return the session to its initial state.
    pub fn reset(&self) {
        self.cancel_poll();
        {
            let mut control = self.control();
            control.start_time = None;
            control.stop_requested_at = None;
            control.since = None;
            control.backoff.reset();
        }
        self.inner.session.reset();
        tracing::info!("run session reset");
    }

    /// Resolves once no polling loop is running.
    pub async fn wait_idle(&self) {
        let done = self.control().poll.as_ref().map(|p| p.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
    }

    fn cancel_poll(&self) {
        if let Some(poll) = self.control().poll.take() {
            tracing::debug!(run_id = %poll.run_id, "cancelling polling loop");
            poll.cancel.cancel();
        }
    }

    fn spawn_poll(&self, run_id: String) {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let previous = self.control().poll.replace(PollHandle {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
            done: done.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let tracker = self.clone();
        let span = tracing::info_span!("poll", run_id = %run_id);
        let task = PollTask {
            run_id,
            cancel,
            tick_in_flight: AtomicBool::new(false),
        };
        tokio::spawn(
            async move {
                let _done = done.drop_guard();
                tracker.poll_loop(&task).await;
            }
            .instrument(span),
        );
    }

    async fn poll_loop(&self, task: &PollTask) {
        tracing::debug!("polling loop started");
        loop {
            if task.cancel.is_cancelled() {
                break;
            }

            if self.tick(task).await == TickOutcome::Finished {
                break;
            }

            let delay = self.control().backoff.next_delay();
            tokio::select! {
                _ = task.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!("polling loop finished");
    }

    async fn tick(&self, task: &PollTask) -> TickOutcome {
        if task.tick_in_flight.swap(true, Ordering::AcqRel) {
            return TickOutcome::Continue;
        }
        let outcome = self.run_tick(&task.run_id, &task.cancel).await;
        task.tick_in_flight.store(false, Ordering::Release);
        outcome
    }

    /// `Some(true)` once the grace window after a stop request has run out,
    /// `Some(false)` while it is still open, `None` without a stop request.
    fn grace_expired(&self) -> Option<bool> {
        self.control()
            .stop_requested_at
            .map(|at| at.elapsed() >= self.inner.policy.grace_window)
    }

    async fn run_tick(&self, run_id: &str, cancel: &CancellationToken) -> TickOutcome {
        if self.grace_expired() == Some(true) {
            tracing::warn!("orchestrator did not confirm cancellation within grace window, abandoning run");
            return TickOutcome::Finished;
        }

        let fetched = self.inner.client.get_run(run_id).await;
        if cancel.is_cancelled() {
            return TickOutcome::Finished;
        }

        let status = match fetched {
            Ok(run) => run.status(),
            Err(e) => match self.grace_expired() {
                Some(false) => {
                    tracing::debug!(error = %e, "status fetch failed during cancellation, tolerated");
                    return TickOutcome::Continue;
                }
                Some(true) => return TickOutcome::Finished,
                None => {
                    tracing::error!(error = %e, "status fetch failed, stopping polling");
                    let message = if e.is_not_found() {
                        "flow run not found".to_string()
                    } else {
                        e.message()
                    };
                    self.inner.session.update(|s| {
                        s.run.set_status(RunStatus::Failed);
                        s.error = Some(message);
                        s.loading = false;
                    });
                    return TickOutcome::Finished;
                }
            },
        };

        let run_ids = self.log_run_ids(run_id);
        let since = self.control().since.clone();
        let fetched_logs = self
            .inner
            .client
            .get_logs(&run_ids, self.inner.policy.log_limit, since.as_deref())
            .await;
        if cancel.is_cancelled() {
            return TickOutcome::Finished;
        }

        match self.grace_expired() {
            Some(true) => {
                tracing::warn!(status = %status, "grace window elapsed, abandoning run");
                return TickOutcome::Finished;
            }
            Some(false) if !status.is_terminal() => {
                tracing::debug!(status = %status, "cancellation pending, update suppressed");
                return TickOutcome::Continue;
            }
            _ => {}
        }

        let (entries, log_error) = match fetched_logs {
            Ok(entries) => (entries, None),
            Err(e) => {
                tracing::warn!(error = %e, "log fetch failed, continuing to poll");
                (Vec::new(), Some(format!("failed to fetch logs: {}", e.message())))
            }
        };

        let runtime = match (status, self.control().start_time) {
            (RunStatus::Running, Some(start)) => start.elapsed().as_secs_f64().round() as u64,
            _ => 0,
        };

        if let Some(newest) = entries
            .iter()
            .map(|e| e.timestamp.as_str())
            .max_by(|a, b| timestamp_order(a, b))
        {
            let mut control = self.control();
            let advance = control
                .since
                .as_deref()
                .is_none_or(|current| timestamp_order(newest, current).is_gt());
            if advance {
                control.since = Some(newest.to_string());
            }
        }

        let terminal = status.is_terminal();
        self.inner.session.update(|s| {
            s.run.set_status(status);
            s.run.set_runtime(runtime);
            s.logs.append(&entries);
            if let Some(error) = log_error {
                s.error = Some(error);
            }
            s.loading = !terminal;
        });

        if !terminal {
            return TickOutcome::Continue;
        }

        tracing::info!(status = %status, "flow run reached terminal status");
        if self.inner.policy.auto_delete_runs {
            match self.inner.client.delete_run(run_id, true).await {
                Ok(()) => tracing::info!("deleted finished flow run"),
                Err(e) => tracing::warn!(error = %e, "failed to delete finished flow run"),
            }
        }
        TickOutcome::Finished
    }

    /// The tracked run first, then any other run still referenced by the
    /// persisted log buffer.
    fn log_run_ids(&self, run_id: &str) -> Vec<String> {
        let mut ids = vec![run_id.to_string()];
        for id in self.inner.session.snapshot().logs.run_ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}
