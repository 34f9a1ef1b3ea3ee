//! Session snapshot and command endpoints.
//!
//! Every command is applied through the session's orchestrator, which
//! writes the snapshot through immediately; background progress is saved by
//! the debounced persister and is visible through `GET /v1/sessions/{id}`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use reelforge_core::{
    BatchHandle, RunHandle, RunId, RunRequest, SessionSnapshot, TaskInput, TaskKey, TaskKind,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/runs", post(start_run))
        .route("/sessions/{id}/runs/{run_id}/cancel", post(cancel_run))
        .route("/sessions/{id}/tasks", post(submit_tasks))
        .route("/sessions/{id}/tasks/{key}/cancel", post(cancel_task))
        .route("/sessions/{id}/tasks/{key}/downloaded", post(mark_downloaded))
}

#[derive(Debug, Deserialize)]
pub struct SubmitTasksRequest {
    pub kind: TaskKind,
    pub inputs: Vec<TaskInput>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadedRequest {
    #[serde(default)]
    pub relocated_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunStarted {
    pub run_id: RunId,
}

#[derive(Debug, Serialize)]
pub struct TasksSubmitted {
    pub keys: Vec<TaskKey>,
}

#[derive(Debug, Serialize)]
pub struct Cancelled {
    pub cancelled: bool,
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ServerError> {
    let orchestrator = state.sessions.get(&id).await?;
    Ok(Json(orchestrator.snapshot().await))
}

pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunStarted>), ServerError> {
    let orchestrator = state.sessions.get(&id).await?;
    let handle = orchestrator.start_run(request).await?;
    let run_id = handle.run_id;
    watch_run(id, handle);
    Ok((StatusCode::ACCEPTED, Json(RunStarted { run_id })))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path((id, run_id)): Path<(String, RunId)>,
) -> Result<Json<Cancelled>, ServerError> {
    let orchestrator = state.sessions.get(&id).await?;
    let cancelled = orchestrator.cancel_run(run_id).await?;
    Ok(Json(Cancelled { cancelled }))
}

pub async fn submit_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SubmitTasksRequest>,
) -> Result<(StatusCode, Json<TasksSubmitted>), ServerError> {
    let orchestrator = state.sessions.get(&id).await?;
    let handle = orchestrator.submit_tasks(request.kind, request.inputs).await?;
    let keys = handle.keys.clone();
    watch_batch(id, handle);
    Ok((StatusCode::ACCEPTED, Json(TasksSubmitted { keys })))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, TaskKey)>,
) -> Result<Json<Cancelled>, ServerError> {
    let orchestrator = state.sessions.get(&id).await?;
    let cancelled = orchestrator.cancel_task(key).await?;
    Ok(Json(Cancelled { cancelled }))
}

pub async fn mark_downloaded(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, TaskKey)>,
    Json(request): Json<DownloadedRequest>,
) -> Result<StatusCode, ServerError> {
    let orchestrator = state.sessions.get(&id).await?;
    orchestrator.mark_downloaded(key, request.relocated_url).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn watch_run(session_id: String, handle: RunHandle) {
    tokio::spawn(async move {
        let run_id = handle.run_id;
        match handle.wait().await {
            Ok(run) => info!(session = %session_id, %run_id, status = %run.status, "run settled"),
            Err(e) => warn!(session = %session_id, %run_id, error = %e, "run aborted"),
        }
    });
}

fn watch_batch(session_id: String, handle: BatchHandle) {
    tokio::spawn(async move {
        match handle.wait().await {
            Ok(fan_out) => info!(
                session = %session_id,
                succeeded = fan_out.succeeded.len(),
                failed = fan_out.failed.len(),
                "batch settled"
            ),
            Err(e) => warn!(session = %session_id, error = %e, "batch aborted"),
        }
    });
}

// ── Tests ──────────────────────────────────────────────────────────────────────
