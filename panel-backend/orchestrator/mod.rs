//! Typed access to the external workflow orchestrator's REST API.
//!
//! [`OrchestratorClient`] exposes one method per remote endpoint plus two
//! composed operations built on top of them: paginated log retrieval and
//! cascading cancellation.

pub mod client;
pub mod error;
pub mod status;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub use client::HttpOrchestratorClient;
pub use error::OrchestratorError;
pub use status::RunStatus;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Largest page requested from `/logs/filter` in one call.
pub const LOGS_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    #[serde(rename = "type")]
    pub state_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowRun {
    pub id: String,
    #[serde(default)]
    pub state: Option<StateSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl FlowRun {
    /// A run with no state yet is reported as `Unknown`.
    pub fn status(&self) -> RunStatus {
        self.state
            .as_ref()
            .map(|s| RunStatus::from_state_type(&s.state_type))
            .unwrap_or(RunStatus::Unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRun {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: Option<StateSnapshot>,
    #[serde(default)]
    pub flow_run_id: Option<String>,
}

impl TaskRun {
    pub fn status(&self) -> RunStatus {
        self.state
            .as_ref()
            .map(|s| RunStatus::from_state_type(&s.state_type))
            .unwrap_or(RunStatus::Unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: String,
    #[serde(
        default,
        deserialize_with = "level_as_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_run_id: Option<String>,
}

/// The orchestrator reports levels as numbers (`20`), older payloads as names.
fn level_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(level_name(&n)),
        _ => None,
    })
}

fn level_name(n: &serde_json::Number) -> String {
    match n.as_u64() {
        Some(50) => "CRITICAL".to_string(),
        Some(40) => "ERROR".to_string(),
        Some(30) => "WARNING".to_string(),
        Some(20) => "INFO".to_string(),
        Some(10) => "DEBUG".to_string(),
        _ => n.to_string(),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Chronological order of two ISO-8601 timestamps; falls back to string order
/// when either side does not parse.
pub fn timestamp_order(a: &str, b: &str) -> Ordering {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Exact-name lookup; `Ok(None)` when no deployment carries that name.
    async fn resolve_deployment(&self, name: &str) -> Result<Option<String>>;

    /// Trigger a new run; `parameters` are forwarded verbatim.
    async fn create_run(&self, deployment_id: &str, parameters: serde_json::Value) -> Result<String>;

    async fn get_run(&self, run_id: &str) -> Result<FlowRun>;

    /// Most recently started runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<FlowRun>>;

    /// One page of logs for the given runs, newest first.
    async fn fetch_logs_page(&self, run_ids: &[String], limit: usize, offset: usize) -> Result<Vec<LogEntry>>;

    async fn list_task_runs(&self, run_id: &str) -> Result<Vec<TaskRun>>;

    async fn set_task_run_state(&self, task_run_id: &str, status: RunStatus, force: bool) -> Result<()>;

    async fn set_run_state(&self, run_id: &str, status: RunStatus, force: bool) -> Result<()>;

    async fn delete_run(&self, run_id: &str, cascade: bool) -> Result<()>;

    /// Task dependency graph of a run, passed through as the orchestrator returns it.
    async fn get_run_graph(&self, run_id: &str) -> Result<serde_json::Value>;

    /// Delete every run in `run_ids` concurrently. All deletions are attempted;
    /// the first failure is returned.
    async fn delete_runs(&self, run_ids: &[String], cascade: bool) -> Result<()> {
        let results = futures::future::join_all(run_ids.iter().map(|id| self.delete_run(id, cascade))).await;

        let mut first_error = None;
        for (run_id, result) in run_ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(run_id = %run_id, error = %e, "failed to delete flow run");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The most recent `limit` log entries of `run_ids`, ascending by timestamp,
    /// optionally restricted to entries at or after `since`.
    async fn get_logs(&self, run_ids: &[String], limit: usize, since: Option<&str>) -> Result<Vec<LogEntry>> {
        if run_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut collected: Vec<LogEntry> = Vec::new();
        let mut offset = 0;

        while collected.len() < limit {
            let page_size = (limit - collected.len()).min(LOGS_PAGE_SIZE);
            let page = self.fetch_logs_page(run_ids, page_size, offset).await?;
            let exhausted = page.len() < page_size;
            offset += page.len();

            let mut crossed_since = false;
            for entry in page {
                match since {
                    Some(since) if timestamp_order(&entry.timestamp, since) == Ordering::Less => {
                        crossed_since = true;
                    }
                    _ => collected.push(entry),
                }
            }

            // Pages arrive newest first, so anything older than `since` ends the scan.
            if exhausted || crossed_since {
                break;
            }
        }

        collected.sort_by(|a, b| timestamp_order(&b.timestamp, &a.timestamp));
        collected.truncate(limit);
        collected.reverse();
        Ok(collected)
    }

    /// Cancel every non-terminal task run of `run_id`, then force the run
    /// itself into `CANCELLED`.
    ///
    /// Children go first: the orchestrator puts a parent back into `RUNNING`
    /// while any child is still active. Child failures are logged and skipped.
    async fn cancel_run_completely(&self, run_id: &str) -> Result<()> {
        let task_runs = match self.list_task_runs(run_id).await {
            Ok(task_runs) => task_runs,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "failed to list task runs, cancelling parent only");
                Vec::new()
            }
        };

        let pending: Vec<&TaskRun> = task_runs
            .iter()
            .filter(|t| !t.status().is_terminal())
            .collect();

        let results = futures::future::join_all(
            pending
                .iter()
                .map(|t| self.set_task_run_state(&t.id, RunStatus::Cancelled, true)),
        )
        .await;

        let mut failed = 0usize;
        for (task_run, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                tracing::warn!(run_id, task_run_id = %task_run.id, error = %e, "failed to cancel task run");
            }
        }

        tracing::info!(run_id, tasks = pending.len(), failed, "cancelling flow run");
        self.set_run_state(run_id, RunStatus::Cancelled, true).await
    }
}
