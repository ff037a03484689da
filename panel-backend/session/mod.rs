//! Observable, persisted client-side session of the tracked run.
//!
//! [`SessionStore`] is the only shared mutable state in the panel. The run
//! tracker is its single writer; any number of readers observe it through a
//! `watch` channel. Every mutation is applied in one step (readers never see a
//! half-applied update) and then written through to durable storage, one key
//! per persisted field.

pub mod logs;
pub mod state;
pub mod storage;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::orchestrator::{LogEntry, RunStatus};

pub use logs::{LOG_LIMIT, LogBuffer};
pub use state::RunState;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};

pub const RUN_ID_KEY: &str = "flowRunId";
pub const STATUS_KEY: &str = "flowStatus";
pub const LOGS_KEY: &str = "flowLogs";
pub const RUNTIME_KEY: &str = "flowRuntime";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSession {
    #[serde(flatten)]
    pub run: RunState,
    pub logs: LogBuffer,
    pub loading: bool,
    pub error: Option<String>,
}

pub struct SessionStore {
    tx: watch::Sender<RunSession>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    /// Held across an update and its write-through so storage sees writes in
    /// the same order as observers see changes.
    persist: Mutex<()>,
}

impl SessionStore {
    /// Ephemeral store, nothing is persisted.
    pub fn in_memory() -> Self {
        let (tx, _) = watch::channel(RunSession::default());
        Self {
            tx,
            storage: None,
            persist: Mutex::new(()),
        }
    }

    /// Store backed by `storage`, seeded from whatever it already holds.
    pub fn restore(storage: Arc<dyn KeyValueStorage>) -> Self {
        let mut session = RunSession::default();
        if let Some(run_id) = read_key::<Option<String>>(storage.as_ref(), RUN_ID_KEY) {
            session.run.run_id = run_id;
        }
        if let Some(status) = read_key::<RunStatus>(storage.as_ref(), STATUS_KEY) {
            session.run.status = status;
        }
        if let Some(entries) = read_key::<Vec<LogEntry>>(storage.as_ref(), LOGS_KEY) {
            session.logs = LogBuffer::from_entries(entries);
        }
        if let Some(runtime) = read_key::<u64>(storage.as_ref(), RUNTIME_KEY) {
            session.run.runtime = runtime;
        }

        tracing::info!(
            run_id = session.run.run_id.as_deref().unwrap_or("-"),
            status = %session.run.status,
            logs = session.logs.len(),
            runtime = session.run.runtime,
            "restored run session"
        );

        let (tx, _) = watch::channel(session);
        Self {
            tx,
            storage: Some(storage),
            persist: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> RunSession {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSession> {
        self.tx.subscribe()
    }

    /// Apply `f` as one observable mutation and persist the fields it changed.
    /// Returns whether anything changed; unchanged sessions notify nobody.
    pub fn update(&self, f: impl FnOnce(&mut RunSession)) -> bool {
        let _persist = self.persist.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut writes: Vec<(&'static str, String)> = Vec::new();

        let modified = self.tx.send_if_modified(|session| {
            let before = session.clone();
            f(session);
            if self.storage.is_some() {
                writes = changed_fields(&before, session);
            }
            *session != before
        });

        if let Some(storage) = &self.storage {
            for (key, value) in writes {
                if let Err(e) = storage.set(key, &value) {
                    tracing::error!(key, error = %e, "failed to persist session field");
                }
            }
        }

        modified
    }

    pub fn set_loading(&self, loading: bool) {
        self.update(|s| s.loading = loading);
    }

    /// Everything back to the initial session.
    pub fn reset(&self) {
        self.update(|s| *s = RunSession::default());
    }
}

/// Field-level operations of the run state and log stores, each applied as
/// its own observable mutation.
#[allow(dead_code)]
impl SessionStore {
    pub fn set_run_id(&self, run_id: Option<String>) {
        self.update(|s| s.run.set_run_id(run_id));
    }

    pub fn set_status(&self, status: RunStatus) {
        self.update(|s| s.run.set_status(status));
    }

    pub fn set_runtime(&self, runtime: u64) {
        self.update(|s| s.run.set_runtime(runtime));
    }

    pub fn set_error(&self, error: Option<String>) {
        self.update(|s| s.error = error);
    }

    pub fn append_logs(&self, entries: &[LogEntry]) {
        if entries.is_empty() {
            return;
        }
        self.update(|s| {
            s.logs.append(entries);
        });
    }

    pub fn replace_logs(&self, entries: Vec<LogEntry>) {
        self.update(|s| s.logs.replace(entries));
    }

    pub fn reset_logs(&self) {
        self.update(|s| s.logs.reset());
    }

    /// Run id, status and runtime back to their initial values in one step.
    pub fn clear_run(&self) {
        self.update(|s| s.run.clear());
    }
}

fn read_key<T: DeserializeOwned>(storage: &dyn KeyValueStorage, key: &str) -> Option<T> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(key, error = %e, "failed to read persisted session field");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "ignoring unreadable persisted session field");
            None
        }
    }
}

fn changed_fields(before: &RunSession, after: &RunSession) -> Vec<(&'static str, String)> {
    let mut writes = Vec::new();
    let mut push = |key: &'static str, value: serde_json::Result<String>| match value {
        Ok(value) => writes.push((key, value)),
        Err(e) => tracing::error!(key, error = %e, "failed to serialize session field"),
    };

    if before.run.run_id != after.run.run_id {
        push(RUN_ID_KEY, serde_json::to_string(&after.run.run_id));
    }
    if before.run.status != after.run.status {
        push(STATUS_KEY, serde_json::to_string(&after.run.status));
    }
    if before.logs != after.logs {
        push(LOGS_KEY, serde_json::to_string(&after.logs));
    }
    if before.run.runtime != after.run.runtime {
        push(RUNTIME_KEY, serde_json::to_string(&after.run.runtime));
    }
    writes
}
