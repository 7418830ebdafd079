//! `/api/execute` and `/api/execute/stream` — run a command in a session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::session::events::Event;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub command: String,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: u64,
    pub timestamp: String,
}

fn session_id_or_default(id: Option<String>) -> String {
    id.unwrap_or_else(|| crate::state::DEFAULT_SESSION_ID.to_string())
}

/// `POST /api/execute` — run one foreground command to completion.
pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, BoxError> {
    let session_id = session_id_or_default(req.session_id);
    if state.pty_manager.has_active_pty(&session_id).await {
        return Err(BoxError::new(
            crate::error::ErrorCode::PtyExclusiveControl,
            format!("session {session_id} has an active pty"),
        ));
    }
    let timeout = req.timeout_ms.map(Duration::from_millis);
    let result = state
        .process_service
        .execute_command(&session_id, &req.command, req.cwd.as_deref(), req.env.as_ref(), timeout)
        .await?;
    Ok(Json(ExecuteResponse {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        duration: result.duration.as_millis() as u64,
        timestamp: result.timestamp,
    }))
}

/// `POST /api/execute/stream` — same as [`execute`] but emits
/// `start`/`stdout`/`stderr`/`complete`/`error` SSE events as they happen.
pub async fn execute_stream(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, BoxError> {
    let session_id = session_id_or_default(req.session_id);
    if state.pty_manager.has_active_pty(&session_id).await {
        return Err(BoxError::new(
            crate::error::ErrorCode::PtyExclusiveControl,
            format!("session {session_id} has an active pty"),
        ));
    }

    let command_id = format!("exec-{}", uuid::Uuid::new_v4());
    let (_pid, _handle, rx) = state
        .session_manager
        .execute_stream_in_session(&session_id, &command_id, &req.command, req.cwd.as_deref(), req.env.as_ref())
        .await?;
    let sessions = state.session_manager.clone();

    // `done` latches once a terminal event fires so `mark_command_finished`
    // runs exactly once.
    let stream = stream::unfold(
        (rx, sessions, session_id, command_id, false),
        |(mut rx, sessions, session_id, command_id, done)| async move {
            if done {
                return None;
            }
            let Some(event) = rx.recv().await else {
                sessions.mark_command_finished(&session_id, &command_id).await;
                return None;
            };
            let is_terminal = matches!(event, Event::Complete { .. } | Event::Error { .. });
            let (name, data) = match &event {
                Event::Start { pid } => ("start", serde_json::json!({ "pid": pid })),
                Event::Stdout { data } => ("stdout", serde_json::json!({ "data": data })),
                Event::Stderr { data } => ("stderr", serde_json::json!({ "data": data })),
                Event::Complete { exit_code, aggregate } => {
                    ("complete", serde_json::json!({ "exitCode": exit_code, "aggregate": aggregate }))
                }
                Event::Error { message } => ("error", serde_json::json!({ "message": message })),
            };
            if is_terminal {
                sessions.mark_command_finished(&session_id, &command_id).await;
            }
            let sse = Ok(SseEvent::default().event(name).data(data.to_string()));
            Some((sse, (rx, sessions, session_id, command_id, is_terminal)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
