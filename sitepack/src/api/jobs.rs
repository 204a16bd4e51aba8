//! Job trigger endpoints.

use super::auth::bearer_token;
use super::error::ApiError;
use super::AppState;
use crate::job::{BackupMachine, JobContext, JobId, Phase, TickReport};
use crate::BackupError;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub job_id: String,
    pub phase: Phase,
    pub pending_files: usize,
    pub pending_tables: usize,
}

/// POST /jobs/{id}/start - Start a fresh job
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StartResponse>, ApiError> {
    let response = with_machine(&state, &id, &headers, |machine, ctx| {
        let started = machine.start(ctx, &[])?;
        Ok(StartResponse {
            job_id: ctx.id.to_string(),
            phase: started.phase,
            pending_files: started.pending_files.len(),
            pending_tables: started.pending_tables.len(),
        })
    })
    .await?;
    Ok(Json(response))
}

/// POST /jobs/{id}/resume - Run one tick
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TickReport>, ApiError> {
    let report = with_machine(&state, &id, &headers, |machine, ctx| machine.resume(ctx)).await?;
    Ok(Json(report))
}

/// GET /jobs/{id}/fetch - Download the finished archive, then clean up
pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let filename = format!("attachment; filename=\"{id}.zip\"");
    let bytes = with_machine(&state, &id, &headers, |machine, ctx| machine.fetch(ctx)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, filename),
        ],
        bytes,
    ))
}

/// DELETE /jobs/{id} - Discard a job and everything it wrote
pub async fn cleanup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    with_machine(&state, &id, &headers, |machine, ctx| machine.cleanup(ctx)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate and authorize, then run `op` on a blocking thread
async fn with_machine<T, F>(state: &AppState, raw_id: &str, headers: &HeaderMap, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&BackupMachine, &JobContext) -> crate::Result<T> + Send + 'static,
{
    let id = JobId::parse(raw_id)?;
    let token = bearer_token(headers).ok_or_else(|| BackupError::Unauthorized("missing bearer token".to_string()))?;
    state.authorizer.authorize(&id, token)?;

    let config = state.config.clone();
    let result = tokio::task::spawn_blocking(move || {
        let machine = BackupMachine::from_config(&config)?;
        let ctx = machine.context(id);
        op(&machine, &ctx)
    })
    .await??;
    Ok(result)
}
