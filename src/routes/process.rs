//! `/api/process/*` — background processes layered on sessions.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::process::{LogChunk, ProcessRecord, ProcessStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StartProcessRequest {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub command: String,
    #[serde(rename = "processId")]
    pub process_id: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct ProcessView {
    pub id: String,
    pub command: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

async fn view(record: &ProcessRecord) -> ProcessView {
    ProcessView {
        id: record.id.clone(),
        command: record.command.clone(),
        session_id: record.session_id.clone(),
        status: record.status(),
        pid: record.pid().await,
        exit_code: record.exit_code().await,
        duration_ms: record.duration().await.as_millis() as u64,
    }
}

/// `POST /api/process/start`
pub async fn start_process(
    State(state): State<AppState>,
    Json(req): Json<StartProcessRequest>,
) -> Result<Json<ProcessView>, BoxError> {
    let session_id = req.session_id.unwrap_or_else(|| crate::state::DEFAULT_SESSION_ID.to_string());
    if state.pty_manager.has_active_pty(&session_id).await {
        return Err(BoxError::new(
            crate::error::ErrorCode::PtyExclusiveControl,
            format!("session {session_id} has an active pty"),
        ));
    }
    let record = state
        .process_service
        .start_process(&session_id, &req.command, req.process_id, req.cwd.as_deref(), req.env.as_ref())
        .await?;
    Ok(Json(view(&record).await))
}

#[derive(Debug, Deserialize)]
pub struct ListProcessesQuery {
    pub status: Option<ProcessStatus>,
}

/// `GET /api/process/list`
pub async fn list_processes(
    State(state): State<AppState>,
    Query(q): Query<ListProcessesQuery>,
) -> Json<Vec<ProcessView>> {
    let records = state.process_service.list_processes(q.status).await;
    let mut out = Vec::with_capacity(records.len());
    for record in &records {
        out.push(view(record).await);
    }
    Json(out)
}

/// `GET /api/process/{id}`
pub async fn get_process(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ProcessView>, BoxError> {
    let record = state.process_service.get_process(&id).await?;
    Ok(Json(view(&record).await))
}

#[derive(Debug, Serialize)]
pub struct ProcessLogsResponse {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// `GET /api/process/{id}/logs` — a snapshot of accumulated output, not a stream.
pub async fn get_process_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessLogsResponse>, BoxError> {
    let record = state.process_service.get_process(&id).await?;
    let buf = record.output.lock().await;
    let (entries, _dropped) = buf.read_since(0);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for entry in entries {
        match entry.stream {
            crate::session::buffer::OutputStream::Stdout => stdout.push(entry.data),
            crate::session::buffer::OutputStream::Stderr => stderr.push(entry.data),
            crate::session::buffer::OutputStream::System => {}
        }
    }
    Ok(Json(ProcessLogsResponse { stdout, stderr }))
}

/// `GET /api/process/{id}/stream` — catch-up-then-follow log stream, closes
/// once the process reaches a terminal status.
pub async fn stream_process_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, BoxError> {
    let rx = state.process_service.stream_process_logs(&id).await?;
    let stream = stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        let (name, data) = match &chunk {
            LogChunk::Stdout(data) => ("stdout", serde_json::json!({ "data": data })),
            LogChunk::Stderr(data) => ("stderr", serde_json::json!({ "data": data })),
            LogChunk::System(data) => ("system", serde_json::json!({ "data": data })),
            LogChunk::Status(status) => ("status", serde_json::json!({ "status": status })),
        };
        Some((Ok(SseEvent::default().event(name).data(data.to_string())), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize, Default)]
pub struct KillProcessQuery {
    pub signal: Option<String>,
}

/// `DELETE /api/process/{id}`
pub async fn kill_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<KillProcessQuery>,
) -> Result<Json<serde_json::Value>, BoxError> {
    let killed = state.process_service.kill_process(&id, q.signal.as_deref()).await?;
    Ok(Json(serde_json::json!({ "killed": killed })))
}

/// `DELETE /api/process/kill-all`
pub async fn kill_all_processes(State(state): State<AppState>) -> Json<serde_json::Value> {
    let killed = state.process_service.kill_all_processes().await;
    Json(serde_json::json!({ "killed": killed }))
}

#[derive(Debug, Deserialize)]
pub struct WaitForLogQuery {
    pub pattern: String,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

/// `GET /api/process/{id}/wait-for-log` — `waitForLog`, exposed for callers
/// that don't want to parse the full log stream client-side.
pub async fn wait_for_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<WaitForLogQuery>,
) -> Result<Json<serde_json::Value>, BoxError> {
    let timeout = Duration::from_millis(q.timeout_ms.unwrap_or(30_000));
    let line = state.process_service.wait_for_log(&id, &q.pattern, timeout).await?;
    Ok(Json(serde_json::json!({ "line": line })))
}

#[derive(Debug, Deserialize)]
pub struct WaitForExitQuery {
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

/// `GET /api/process/{id}/wait-for-exit` — `waitForExit`.
pub async fn wait_for_exit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<WaitForExitQuery>,
) -> Result<Json<serde_json::Value>, BoxError> {
    let timeout = Duration::from_millis(q.timeout_ms.unwrap_or(30_000));
    let exit_code = state.process_service.wait_for_exit(&id, timeout).await?;
    Ok(Json(serde_json::json!({ "exitCode": exit_code })))
}
