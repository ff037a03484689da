use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::error::OrchestratorError;
use super::{Deployment, FlowRun, LogEntry, OrchestratorClient, Result, RunStatus, TaskRun};

pub struct HttpOrchestratorClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

impl HttpOrchestratorClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let resp = request.send().await.map_err(OrchestratorError::from)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(OrchestratorError::Http {
            status: status.as_u16(),
            message: error_message(status, &body),
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = self.send(request).await?;
        resp.json::<T>()
            .await
            .map_err(|e| OrchestratorError::Malformed(e.to_string()))
    }

    fn state_body(status: RunStatus, force: bool) -> serde_json::Value {
        json!({
            "state": { "type": status.as_str(), "name": state_name(status) },
            "force": force,
        })
    }
}

/// The orchestrator wraps error text in `{"detail": ...}`; fall back to the raw
/// body, then to the canonical reason phrase.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| match v.get("detail") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        });

    detail
        .or_else(|| Some(body.trim().to_string()).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string())
}

/// Human-readable state name sent alongside the type, e.g. `Cancelled`.
fn state_name(status: RunStatus) -> String {
    let raw = status.as_str().to_ascii_lowercase().replace('_', " ");
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn resolve_deployment(&self, name: &str) -> Result<Option<String>> {
        let deployments: Vec<Deployment> = self
            .send_json(
                self.client
                    .post(self.url("deployments/filter"))
                    .json(&json!({ "name": { "any_": [name] } })),
            )
            .await?;

        Ok(deployments.into_iter().find(|d| d.name == name).map(|d| d.id))
    }

    async fn create_run(&self, deployment_id: &str, parameters: serde_json::Value) -> Result<String> {
        let created: Created = self
            .send_json(
                self.client
                    .post(self.url(&format!("deployments/{deployment_id}/create_flow_run")))
                    .json(&json!({ "parameters": parameters })),
            )
            .await?;
        Ok(created.id)
    }

    async fn get_run(&self, run_id: &str) -> Result<FlowRun> {
        self.send_json(self.client.get(self.url(&format!("flow_runs/{run_id}"))))
            .await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<FlowRun>> {
        self.send_json(
            self.client
                .post(self.url("flow_runs/filter"))
                .json(&json!({ "limit": limit, "sort": "START_TIME_DESC" })),
        )
        .await
    }

    async fn fetch_logs_page(&self, run_ids: &[String], limit: usize, offset: usize) -> Result<Vec<LogEntry>> {
        self.send_json(self.client.post(self.url("logs/filter")).json(&json!({
            "flow_run_id": { "any_": run_ids },
            "limit": limit,
            "offset": offset,
            "sort": "TIMESTAMP_DESC",
        })))
        .await
    }

    async fn list_task_runs(&self, run_id: &str) -> Result<Vec<TaskRun>> {
        self.send_json(
            self.client
                .post(self.url("task_runs/filter"))
                .json(&json!({ "flow_run_id": { "any_": [run_id] } })),
        )
        .await
    }

    async fn set_task_run_state(&self, task_run_id: &str, status: RunStatus, force: bool) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!("task_runs/{task_run_id}/set_state")))
                .json(&Self::state_body(status, force)),
        )
        .await?;
        Ok(())
    }

    async fn set_run_state(&self, run_id: &str, status: RunStatus, force: bool) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!("flow_runs/{run_id}/set_state")))
                .json(&Self::state_body(status, force)),
        )
        .await?;
        Ok(())
    }

    async fn delete_run(&self, run_id: &str, cascade: bool) -> Result<()> {
        self.send(
            self.client
                .delete(self.url(&format!("flow_runs/{run_id}")))
                .query(&[("cascade", cascade.to_string())]),
        )
        .await?;
        Ok(())
    }

    async fn get_run_graph(&self, run_id: &str) -> Result<serde_json::Value> {
        self.send_json(self.client.get(self.url(&format!("flow_runs/{run_id}/graph"))))
            .await
    }
}
