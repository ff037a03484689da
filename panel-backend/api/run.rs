use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, AppState, orchestrator_error};
use crate::tracker::StartOutcome;

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/run", get(get_session))
        .route("/run/start", post(start_run))
        .route("/run/stop", post(stop_run))
        .route("/run/reset", post(reset_run))
        .route("/runs", get(list_runs))
        .route("/runs/delete", post(delete_runs))
        .route("/runs/{id}/graph", get(get_run_graph))
        .route("/deployment", get(get_deployment))
}

/// GET /run: snapshot of the tracked run session
pub(crate) async fn get_session(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.tracker.session().snapshot()))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Defaults to the configured deployment.
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// POST /run/start: launch a run and begin tracking it. The body is optional.
pub(crate) async fn start_run(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let deployment_id = match body.deployment_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => state
            .deployments
            .resolve()
            .await
            .map_err(|e| orchestrator_error(&e))?
            .ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": format!("deployment {} not found", state.deployments.name()) })),
                )
            })?,
    };

    let parameters = body.parameters.unwrap_or_else(|| json!({}));
    match state.tracker.start(&deployment_id, parameters).await {
        Ok(StartOutcome::Started(run_id)) => Ok(Json(json!({
            "run_id": run_id,
            "deployment_id": deployment_id,
        }))),
        Ok(StartOutcome::AlreadyActive) => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "a run is already active",
                "run_id": state.tracker.session().snapshot().run.run_id,
            })),
        )),
        Err(e) => Err(orchestrator_error(&e)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    /// Defaults to the tracked run.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// POST /run/stop: cascading cancellation of a run, the tracked one without a body
pub(crate) async fn stop_run(
    State(state): State<AppState>,
    body: Option<Json<StopRequest>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let session = state.tracker.session().snapshot();
    let run_id = body
        .run_id
        .filter(|id| !id.is_empty())
        .or(session.run.run_id.clone())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, Json(json!({ "error": "no run to stop" }))))?;

    if session.run.run_id.as_deref() == Some(run_id.as_str()) && !session.run.status.is_stoppable() {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("run is {} and cannot be stopped", session.run.status),
            })),
        ));
    }

    state
        .tracker
        .stop(&run_id)
        .await
        .map_err(|e| orchestrator_error(&e))?;

    Ok(Json(json!({ "success": true, "run_id": run_id })))
}

/// POST /run/reset: drop the tracked run and clear the session
pub(crate) async fn reset_run(State(state): State<AppState>) -> Json<Value> {
    state.tracker.reset();
    Json(json!({ "success": true }))
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// GET /runs: most recent runs known to the orchestrator
pub(crate) async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    let runs = state
        .tracker
        .client()
        .list_runs(limit)
        .await
        .map_err(|e| orchestrator_error(&e))?;

    let runs: Vec<Value> = runs
        .iter()
        .map(|run| {
            json!({
                "id": run.id,
                "name": run.name,
                "deployment_id": run.deployment_id,
                "status": run.status(),
                "timestamp": run.state.as_ref().and_then(|s| s.timestamp.clone()),
            })
        })
        .collect();
    Ok(Json(json!({ "runs": runs })))
}

/// GET /runs/{id}/graph: task dependency graph of a run
pub(crate) async fn get_run_graph(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let graph = state
        .tracker
        .client()
        .get_run_graph(&id)
        .await
        .map_err(|e| orchestrator_error(&e))?;
    Ok(Json(json!({ "graph": graph })))
}

fn default_cascade() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DeleteRunsRequest {
    pub run_ids: Vec<String>,
    #[serde(default = "default_cascade")]
    pub cascade: bool,
}

/// POST /runs/delete: delete several runs, cascading by default
pub(crate) async fn delete_runs(
    State(state): State<AppState>,
    Json(body): Json<DeleteRunsRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.run_ids.is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "run_ids is empty" }))));
    }

    state
        .tracker
        .client()
        .delete_runs(&body.run_ids, body.cascade)
        .await
        .map_err(|e| orchestrator_error(&e))?;

    tracing::info!(count = body.run_ids.len(), cascade = body.cascade, "deleted flow runs");
    Ok(Json(json!({ "success": true, "deleted": body.run_ids.len() })))
}

/// GET /deployment: id of the configured deployment
pub(crate) async fn get_deployment(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let name = state.deployments.name();
    match state.deployments.resolve().await {
        Ok(Some(id)) => Ok(Json(json!({ "name": name, "id": id }))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("deployment {name} not found") })),
        )),
        Err(e) => Err(orchestrator_error(&e)),
    }
}
