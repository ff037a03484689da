pub mod interchange;
pub mod live;
mod routes;
pub mod run;


use std::sync::Arc;

use axum::Json;
use axum::Router;
use hyper::StatusCode;
use serde_json::{Value, json};

use crate::interchange::InterchangeDir;
use crate::orchestrator::OrchestratorError;
use crate::tracker::{DeploymentResolver, RunTracker};

#[derive(Clone)]
pub struct AppState {
    pub tracker: RunTracker,
    /// Resolves the configured deployment name for `start` requests without an id.
    pub deployments: Arc<DeploymentResolver>,
    pub interchange: InterchangeDir,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

/// 404 stays 404, anything else the orchestrator did wrong is a bad gateway.
pub(crate) fn orchestrator_error(e: &OrchestratorError) -> ApiError {
    let code = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_GATEWAY
    };
    let body = e.body();
    (code, Json(json!({ "error": body.message, "status": body.status })))
}
