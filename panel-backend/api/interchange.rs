use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use hyper::{StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

use super::{ApiError, AppState};
use crate::interchange::InterchangeError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/interchange/list", get(list_files))
        .route("/interchange", post(download_file).put(delete_by_query))
        .route("/interchange/delete/{name}", delete(delete_by_path))
}

fn interchange_error(e: &InterchangeError) -> ApiError {
    let code = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(json!({ "success": false, "error": e.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub file: Option<String>,
}

/// GET /interchange/list
pub(crate) async fn list_files(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let files = state.interchange.list().await.map_err(|e| {
        tracing::warn!(dir = %state.interchange.root().display(), error = %e, "failed to list interchange files");
        (StatusCode::BAD_REQUEST, Json(json!({ "error": "failed to list files" })))
    })?;
    Ok(Json(json!({ "files": files })))
}

/// POST /interchange?file=NAME streams the file back as an attachment.
pub(crate) async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let raw = query.file.unwrap_or_default();
    let download = state.interchange.open(&raw).await.map_err(|e| {
        if matches!(e, InterchangeError::Io(_)) {
            tracing::error!(file = %raw, error = %e, "download failed");
        }
        interchange_error(&e)
    })?;

    tracing::info!(file = %download.name, size = download.size, "serving interchange file");
    let headers = [
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download.name),
        ),
        (header::CONTENT_TYPE, download.content_type.to_string()),
        (header::CONTENT_LENGTH, download.size.to_string()),
    ];
    let body = Body::from_stream(ReaderStream::new(download.file));
    Ok((headers, body).into_response())
}

/// PUT /interchange?file=NAME
pub(crate) async fn delete_by_query(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<Value>, ApiError> {
    delete_file(&state, &query.file.unwrap_or_default()).await
}

/// DELETE /interchange/delete/{name}
pub(crate) async fn delete_by_path(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    delete_file(&state, &name).await
}

async fn delete_file(state: &AppState, raw: &str) -> Result<Json<Value>, ApiError> {
    let name = state.interchange.delete(raw).await.map_err(|e| {
        if matches!(e, InterchangeError::Io(_) | InterchangeError::PermissionDenied) {
            tracing::error!(file = %raw, error = %e, "delete failed");
        }
        interchange_error(&e)
    })?;
    Ok(Json(json!({
        "success": true,
        "message": format!("File {name} deleted successfully"),
    })))
}
