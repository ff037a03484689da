use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::orchestrator::{FlowRun, LogEntry, StateSnapshot, TaskRun};
use crate::session::{KeyValueStorage, MemoryStorage};

const RUN: &str = "run-456";

/// One scripted answer to `get_run`, plus the logs the orchestrator holds from
/// that poll onwards.
struct Poll {
    status: Result<&'static str, OrchestratorError>,
    logs: Option<Vec<LogEntry>>,
}

fn poll(status: &'static str) -> Poll {
    Poll { status: Ok(status), logs: None }
}

fn poll_with_logs(status: &'static str, logs: Vec<LogEntry>) -> Poll {
    Poll { status: Ok(status), logs: Some(logs) }
}

fn poll_err(status: u16) -> Poll {
    Poll {
        status: Err(OrchestratorError::Http {
            status,
            message: "boom".into(),
        }),
        logs: None,
    }
}

fn entry(message: &str, timestamp: &str) -> LogEntry {
    entry_of(RUN, message, timestamp)
}

fn entry_of(run_id: &str, message: &str, timestamp: &str) -> LogEntry {
    LogEntry {
        message: message.into(),
        timestamp: timestamp.into(),
        level: Some("INFO".into()),
        flow_run_id: Some(run_id.into()),
    }
}

#[derive(Default)]
struct FakeOrchestrator {
    create: Mutex<Option<Result<String, OrchestratorError>>>,
    script: Mutex<VecDeque<Poll>>,
    /// Answer repeated once the script runs dry.
    last: Mutex<Option<Result<&'static str, OrchestratorError>>>,
    logs: Mutex<Vec<LogEntry>>,
    logs_error: Mutex<Option<OrchestratorError>>,
    cancel_error: Mutex<Option<OrchestratorError>>,
    /// `create_run` never answers while set.
    create_hangs: AtomicBool,
    /// `get_run` never answers while set.
    get_run_hangs: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeOrchestrator {
    fn scripted(polls: Vec<Poll>) -> Arc<Self> {
        let fake = Self::default();
        *fake.create.lock().unwrap() = Some(Ok(RUN.to_string()));
        *fake.script.lock().unwrap() = polls.into();
        Arc::new(fake)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrchestratorClient for FakeOrchestrator {
    async fn resolve_deployment(&self, name: &str) -> crate::orchestrator::Result<Option<String>> {
        self.record(format!("resolve {name}"));
        Ok(Some("dep-123".into()))
    }

    async fn create_run(&self, deployment_id: &str, _parameters: serde_json::Value) -> crate::orchestrator::Result<String> {
        self.record(format!("create {deployment_id}"));
        if self.create_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.create
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(OrchestratorError::Transport("no script".into())))
    }

    async fn get_run(&self, run_id: &str) -> crate::orchestrator::Result<FlowRun> {
        self.record(format!("get_run {run_id}"));
        if self.get_run_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let status = match next {
            Some(poll) => {
                if let Some(logs) = poll.logs {
                    *self.logs.lock().unwrap() = logs;
                }
                *self.last.lock().unwrap() = Some(poll.status.clone());
                poll.status
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Ok("PENDING")),
        }?;
        Ok(FlowRun {
            id: run_id.to_string(),
            state: Some(StateSnapshot {
                state_type: status.to_string(),
                name: None,
                timestamp: None,
            }),
            deployment_id: Some("dep-123".into()),
            name: None,
        })
    }

    async fn list_runs(&self, _limit: usize) -> crate::orchestrator::Result<Vec<FlowRun>> {
        Ok(Vec::new())
    }

    async fn fetch_logs_page(
        &self,
        run_ids: &[String],
        limit: usize,
        offset: usize,
    ) -> crate::orchestrator::Result<Vec<LogEntry>> {
        self.record(format!("logs {}", run_ids.join(",")));
        if let Some(e) = self.logs_error.lock().unwrap().clone() {
            return Err(e);
        }
        let mut logs = self.logs.lock().unwrap().clone();
        logs.sort_by(|a, b| timestamp_order(&b.timestamp, &a.timestamp));
        Ok(logs.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_task_runs(&self, run_id: &str) -> crate::orchestrator::Result<Vec<TaskRun>> {
        self.record(format!("list_tasks {run_id}"));
        Ok(Vec::new())
    }

    async fn set_task_run_state(&self, task_run_id: &str, status: RunStatus, _force: bool) -> crate::orchestrator::Result<()> {
        self.record(format!("task_state {task_run_id} {status}"));
        Ok(())
    }

    async fn set_run_state(&self, run_id: &str, status: RunStatus, _force: bool) -> crate::orchestrator::Result<()> {
        self.record(format!("run_state {run_id} {status}"));
        match self.cancel_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn delete_run(&self, run_id: &str, cascade: bool) -> crate::orchestrator::Result<()> {
        self.record(format!("delete {run_id} cascade={cascade}"));
        Ok(())
    }

    async fn get_run_graph(&self, run_id: &str) -> crate::orchestrator::Result<serde_json::Value> {
        self.record(format!("graph {run_id}"));
        Ok(json!([]))
    }
}

fn tracker_with(fake: &Arc<FakeOrchestrator>, session: SessionStore, policy: PollPolicy) -> RunTracker {
    RunTracker::new(fake.clone(), Arc::new(session), policy)
}

fn tracker(fake: &Arc<FakeOrchestrator>) -> RunTracker {
    tracker_with(fake, SessionStore::in_memory(), PollPolicy::default())
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_run_progresses_to_completion() {
    let fake = FakeOrchestrator::scripted(vec![
        poll("PENDING"),
        poll_with_logs("RUNNING", vec![entry("step1", "t1")]),
        poll("COMPLETED"),
    ]);
    let tracker = tracker(&fake);

    let outcome = tracker.start("dep-123", json!({})).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started(RUN.into()));

    // First poll fires immediately.
    advance(10).await;
    let s = tracker.session().snapshot();
    assert_eq!(s.run.run_id.as_deref(), Some(RUN));
    assert_eq!(s.run.status, RunStatus::Pending);
    assert_eq!(s.run.runtime, 0);
    assert!(s.logs.is_empty());
    assert!(s.loading);

    // Second poll after the initial 1s delay.
    advance(1000).await;
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Running);
    assert_eq!(s.run.runtime, 1);
    assert_eq!(s.logs.entries(), &[entry("step1", "t1")]);

    // Third poll 1.5s later.
    advance(1500).await;
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Completed);
    assert_eq!(s.run.runtime, 0);
    assert_eq!(s.logs.len(), 1);
    assert!(!s.loading);
    assert!(s.error.is_none());

    tracker.wait_idle().await;
    assert!(!tracker.is_polling());
    advance(60_000).await;
    assert_eq!(fake.count("get_run"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_marks_failed_without_polling() {
    let fake = FakeOrchestrator::scripted(vec![]);
    *fake.create.lock().unwrap() = Some(Err(OrchestratorError::Http {
        status: 422,
        message: "bad parameters".into(),
    }));
    let tracker = tracker(&fake);

    let err = tracker.start("dep-123", json!({})).await.unwrap_err();
    assert_eq!(err.status(), Some(422));

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Failed);
    assert_eq!(s.error.as_deref(), Some("bad parameters"));
    assert!(s.run.run_id.is_none());
    assert!(!s.loading);
    assert!(!tracker.is_polling());

    advance(5_000).await;
    assert_eq!(fake.count("get_run"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_is_ignored_while_run_active() {
    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING")]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;

    let again = tracker.start("dep-123", json!({})).await.unwrap();
    assert_eq!(again, StartOutcome::AlreadyActive);
    assert_eq!(fake.count("create"), 1);
    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_start_releases_guard() {
    let fake = FakeOrchestrator::scripted(vec![poll("PENDING")]);
    fake.create_hangs.store(true, Ordering::SeqCst);
    let tracker = tracker(&fake);

    let abandoned = tokio::time::timeout(Duration::from_secs(1), tracker.start("dep-123", json!({}))).await;
    assert!(abandoned.is_err());

    let s = tracker.session().snapshot();
    assert!(!s.loading);
    assert!(s.run.run_id.is_none());
    assert!(!tracker.is_polling());

    fake.create_hangs.store(false, Ordering::SeqCst);
    let outcome = tracker.start("dep-123", json!({})).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started(RUN.into()));
    assert_eq!(fake.count("create"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_clears_previous_logs() {
    let fake = FakeOrchestrator::scripted(vec![poll("PENDING")]);
    let session = SessionStore::in_memory();
    session.append_logs(&[entry("old", "2025-01-01T00:00:00Z")]);
    session.set_status(RunStatus::Completed);
    let tracker = tracker_with(&fake, session, PollPolicy::default());

    tracker.start("dep-123", json!({})).await.unwrap();
    assert!(tracker.session().snapshot().logs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_status_fetch_failure_stops_polling() {
    let fake = FakeOrchestrator::scripted(vec![poll("PENDING"), poll_err(500)]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(1010).await;

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Failed);
    assert_eq!(s.error.as_deref(), Some("boom"));
    assert!(!s.loading);

    tracker.wait_idle().await;
    advance(30_000).await;
    assert_eq!(fake.count("get_run"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_run_reports_not_found() {
    let fake = FakeOrchestrator::scripted(vec![poll_err(404)]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    tracker.wait_idle().await;

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Failed);
    assert_eq!(s.error.as_deref(), Some("flow run not found"));
}

#[tokio::test(start_paused = true)]
async fn test_log_failure_is_tolerated() {
    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING"), poll("RUNNING"), poll("COMPLETED")]);
    *fake.logs_error.lock().unwrap() = Some(OrchestratorError::Transport("connection reset".into()));
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Running);
    assert!(s.error.as_deref().unwrap().starts_with("failed to fetch logs"));
    assert!(tracker.is_polling());

    tracker.wait_idle().await;
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Completed);
    assert!(!s.loading);
    assert_eq!(fake.count("get_run"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_logs_are_fetched_incrementally() {
    let fake = FakeOrchestrator::scripted(vec![
        poll_with_logs("RUNNING", vec![entry("a", "2025-01-01T00:00:01Z")]),
        poll_with_logs(
            "RUNNING",
            vec![entry("a", "2025-01-01T00:00:01Z"), entry("b", "2025-01-01T00:00:02Z")],
        ),
        poll("COMPLETED"),
    ]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    tracker.wait_idle().await;

    let messages: Vec<_> = tracker
        .session()
        .snapshot()
        .logs
        .entries()
        .iter()
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(messages, vec!["a", "b"]);
    assert!(fake.calls().contains(&format!("logs {RUN}")));
}

#[tokio::test(start_paused = true)]
async fn test_stop_grace_window_abandons_unconverged_run() {
    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING")]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;
    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Running);

    tracker.stop(RUN).await.unwrap();
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Stopped);
    assert!(!s.loading);
    assert!(fake.calls().contains(&format!("run_state {RUN} CANCELLED")));

    let mut rx = tracker.session().subscribe();
    rx.borrow_and_update();

    // The orchestrator keeps answering RUNNING; those polls are suppressed.
    advance(5_000).await;
    assert!(tracker.is_polling());
    assert!(!rx.has_changed().unwrap());

    tracker.wait_idle().await;
    let polls = fake.count("get_run");
    advance(60_000).await;

    assert_eq!(fake.count("get_run"), polls);
    assert!(!rx.has_changed().unwrap());
    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_converges_to_cancelled() {
    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING"), poll("CANCELLING"), poll("CANCELLED")]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;
    tracker.stop(RUN).await.unwrap();
    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Stopped);

    tracker.wait_idle().await;
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Cancelled);
    assert!(!s.loading);
}

#[tokio::test(start_paused = true)]
async fn test_status_errors_tolerated_during_cancellation() {
    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING"), poll_err(503), poll("CANCELLED")]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;
    tracker.stop(RUN).await.unwrap();

    tracker.wait_idle().await;
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Cancelled);
    assert!(s.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_failure_is_surfaced() {
    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING")]);
    *fake.cancel_error.lock().unwrap() = Some(OrchestratorError::Http {
        status: 409,
        message: "state transition rejected".into(),
    });
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;

    assert!(tracker.stop(RUN).await.is_err());
    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Running);
    assert_eq!(s.error.as_deref(), Some("state transition rejected"));
    assert!(!s.loading);
}

#[tokio::test(start_paused = true)]
async fn test_stop_untracked_run_leaves_session_alone() {
    let fake = FakeOrchestrator::scripted(vec![]);
    let tracker = tracker(&fake);

    tracker.stop("other-run").await.unwrap();

    assert_eq!(tracker.session().snapshot(), crate::session::RunSession::default());
    assert!(!tracker.is_polling());
    assert_eq!(fake.calls(), vec!["list_tasks other-run", "run_state other-run CANCELLED"]);
}

#[tokio::test(start_paused = true)]
async fn test_resume_continues_persisted_run() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("flowRunId", &json!(RUN).to_string()).unwrap();
    storage.set("flowStatus", "\"RUNNING\"").unwrap();
    storage.set("flowRuntime", "42").unwrap();
    storage
        .set(
            "flowLogs",
            &serde_json::to_string(&vec![entry("seen", "2025-01-01T00:00:05Z")]).unwrap(),
        )
        .unwrap();

    let fake = FakeOrchestrator::scripted(vec![poll_with_logs(
        "RUNNING",
        vec![
            entry("ancient", "2025-01-01T00:00:01Z"),
            entry("seen", "2025-01-01T00:00:05Z"),
            entry("fresh", "2025-01-01T00:00:06Z"),
        ],
    )]);
    let tracker = tracker_with(&fake, SessionStore::restore(storage.clone()), PollPolicy::default());

    assert!(tracker.resume());
    assert!(!tracker.resume());
    advance(10).await;

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Running);
    assert_eq!(s.run.runtime, 42);
    let messages: Vec<_> = s.logs.entries().iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["seen", "fresh"]);
    assert_eq!(fake.count("create"), 0);
    assert_eq!(storage.get("flowRuntime").unwrap().as_deref(), Some("42"));
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_finished_or_empty_sessions() {
    let fake = FakeOrchestrator::scripted(vec![]);

    let tracker = tracker(&fake);
    assert!(!tracker.resume());

    let storage = Arc::new(MemoryStorage::new());
    storage.set("flowRunId", &json!(RUN).to_string()).unwrap();
    storage.set("flowStatus", "\"COMPLETED\"").unwrap();
    let tracker = tracker_with(&fake, SessionStore::restore(storage.clone()), PollPolicy::default());
    assert!(!tracker.resume());

    storage.set("flowStatus", "\"NOT_STARTED\"").unwrap();
    let tracker = tracker_with(&fake, SessionStore::restore(storage.clone()), PollPolicy::default());
    assert!(!tracker.resume());

    storage.remove("flowRunId").unwrap();
    storage.set("flowStatus", "\"RUNNING\"").unwrap();
    let tracker = tracker_with(&fake, SessionStore::restore(storage), PollPolicy::default());
    assert!(!tracker.resume());

    assert_eq!(fake.count("get_run"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_stopped_run_picks_up_cancellation() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("flowRunId", &json!(RUN).to_string()).unwrap();
    storage.set("flowStatus", "\"STOPPED\"").unwrap();

    let fake = FakeOrchestrator::scripted(vec![poll("CANCELLING"), poll("CANCELLED")]);
    let tracker = tracker_with(&fake, SessionStore::restore(storage.clone()), PollPolicy::default());

    assert!(tracker.resume());
    assert!(!tracker.session().snapshot().loading);
    tracker.wait_idle().await;

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Cancelled);
    assert!(!s.loading);
    assert_eq!(storage.get("flowStatus").unwrap().as_deref(), Some("\"CANCELLED\""));
    assert_eq!(fake.count("create"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_stopped_run_is_bounded_by_grace_window() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("flowRunId", &json!(RUN).to_string()).unwrap();
    storage.set("flowStatus", "\"STOPPED\"").unwrap();

    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING")]);
    let tracker = tracker_with(&fake, SessionStore::restore(storage), PollPolicy::default());

    assert!(tracker.resume());
    tracker.wait_idle().await;

    let polls = fake.count("get_run");
    assert!(polls > 0);
    advance(60_000).await;
    assert_eq!(fake.count("get_run"), polls);

    let s = tracker.session().snapshot();
    assert_eq!(s.run.status, RunStatus::Stopped);
    assert!(!s.loading);
}

#[tokio::test(start_paused = true)]
async fn test_resume_unknown_status_keeps_polling() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("flowRunId", &json!(RUN).to_string()).unwrap();
    storage.set("flowStatus", "\"UNKNOWN\"").unwrap();

    let fake = FakeOrchestrator::scripted(vec![poll("RUNNING"), poll("COMPLETED")]);
    let tracker = tracker_with(&fake, SessionStore::restore(storage), PollPolicy::default());

    assert!(tracker.resume());
    tracker.wait_idle().await;
    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_resume_fetches_logs_for_every_buffered_run() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("flowRunId", &json!(RUN).to_string()).unwrap();
    storage.set("flowStatus", "\"RUNNING\"").unwrap();
    storage
        .set(
            "flowLogs",
            &serde_json::to_string(&vec![
                entry_of("run-old", "old step", "2025-01-01T00:00:01Z"),
                entry("new step", "2025-01-01T00:00:02Z"),
            ])
            .unwrap(),
        )
        .unwrap();

    let fake = FakeOrchestrator::scripted(vec![poll_with_logs(
        "RUNNING",
        vec![
            entry_of("run-old", "old step", "2025-01-01T00:00:01Z"),
            entry("new step", "2025-01-01T00:00:02Z"),
            entry_of("run-old", "old cleanup", "2025-01-01T00:00:03Z"),
            entry("next step", "2025-01-01T00:00:04Z"),
        ],
    )]);
    let tracker = tracker_with(&fake, SessionStore::restore(storage), PollPolicy::default());

    assert!(tracker.resume());
    advance(10).await;

    assert!(fake.calls().contains(&format!("logs {RUN},run-old")));
    let s = tracker.session().snapshot();
    let seen: Vec<_> = s
        .logs
        .entries()
        .iter()
        .map(|e| (e.flow_run_id.as_deref().unwrap_or(""), e.message.as_str()))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("run-old", "old step"),
            (RUN, "new step"),
            ("run-old", "old cleanup"),
            (RUN, "next step"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_auto_delete_after_terminal_status() {
    let fake = FakeOrchestrator::scripted(vec![poll("FAILED")]);
    let policy = PollPolicy {
        auto_delete_runs: true,
        ..PollPolicy::default()
    };
    let tracker = tracker_with(&fake, SessionStore::in_memory(), policy);

    tracker.start("dep-123", json!({})).await.unwrap();
    tracker.wait_idle().await;

    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Failed);
    assert!(fake.calls().contains(&format!("delete {RUN} cascade=true")));
}

#[tokio::test(start_paused = true)]
async fn test_reset_cancels_polling_and_clears_session() {
    let fake = FakeOrchestrator::scripted(vec![poll_with_logs("RUNNING", vec![entry("x", "t1")])]);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;
    assert!(tracker.is_polling());

    tracker.reset();
    tracker.wait_idle().await;
    assert!(!tracker.is_polling());
    assert_eq!(tracker.session().snapshot(), crate::session::RunSession::default());

    let polls = fake.count("get_run");
    advance(30_000).await;
    assert_eq!(fake.count("get_run"), polls);
}

#[tokio::test(start_paused = true)]
async fn test_new_loop_polls_while_cancelled_tick_is_stuck() {
    let fake = FakeOrchestrator::scripted(vec![]);
    *fake.last.lock().unwrap() = Some(Ok("PENDING"));
    fake.get_run_hangs.store(true, Ordering::SeqCst);
    let tracker = tracker(&fake);

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;
    assert_eq!(fake.count("get_run"), 1);

    // The first loop stays parked inside get_run after the reset.
    tracker.reset();
    fake.get_run_hangs.store(false, Ordering::SeqCst);
    fake.script.lock().unwrap().push_back(poll("RUNNING"));

    tracker.start("dep-123", json!({})).await.unwrap();
    advance(10).await;

    assert_eq!(fake.count("get_run"), 2);
    assert_eq!(tracker.session().snapshot().run.status, RunStatus::Running);
}

#[tokio::test]
async fn test_deployment_resolver_caches_hits() {
    let fake = FakeOrchestrator::scripted(vec![]);
    let resolver = DeploymentResolver::new(fake.clone(), "seo_content_pipeline_light");

    assert_eq!(resolver.resolve().await.unwrap().as_deref(), Some("dep-123"));
    assert_eq!(resolver.resolve().await.unwrap().as_deref(), Some("dep-123"));
    assert_eq!(fake.count("resolve"), 1);
    assert_eq!(resolver.name(), "seo_content_pipeline_light");
}
