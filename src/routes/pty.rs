//! `/api/pty/*` — PTY lifecycle and I/O (HTTP fallback; the WS adapter is the
//! primary interactive path).

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::pty::{PtyHandle, PtyOptions, PtyState};
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct CreatePtyRequest {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub command: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "disconnectTimeoutMs")]
    pub disconnect_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PtyView {
    pub id: String,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub command: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub state: PtyState,
}

async fn view(handle: &PtyHandle) -> PtyView {
    let (cols, rows) = handle.size().await;
    PtyView {
        id: handle.id.clone(),
        session_id: handle.session_id.clone(),
        command: handle.command.clone(),
        cwd: handle.cwd.clone(),
        cols,
        rows,
        state: handle.state(),
    }
}

/// `POST /api/pty`
pub async fn create_pty(
    State(state): State<AppState>,
    Json(req): Json<CreatePtyRequest>,
) -> Result<Json<PtyView>, BoxError> {
    let handle = state
        .pty_manager
        .create(PtyOptions {
            cols: req.cols,
            rows: req.rows,
            command: req.command,
            cwd: req.cwd,
            env: req.env,
            session_id: req.session_id,
            disconnect_timeout: req.disconnect_timeout_ms.map(std::time::Duration::from_millis),
        })
        .await?;
    Ok(Json(view(&handle).await))
}

/// `POST /api/pty/attach/{sessionId}` — same as [`create_pty`] but bound to
/// an existing session id, rejecting if that session already has one running.
pub async fn attach_pty(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<CreatePtyRequest>,
) -> Result<Json<PtyView>, BoxError> {
    let handle = state
        .pty_manager
        .create(PtyOptions {
            cols: req.cols,
            rows: req.rows,
            command: req.command,
            cwd: req.cwd,
            env: req.env,
            session_id: Some(session_id),
            disconnect_timeout: req.disconnect_timeout_ms.map(std::time::Duration::from_millis),
        })
        .await?;
    Ok(Json(view(&handle).await))
}

/// `GET /api/pty`
pub async fn list_ptys(State(state): State<AppState>) -> Json<Vec<PtyView>> {
    let ptys = state.pty_manager.list().await;
    let mut out = Vec::with_capacity(ptys.len());
    for handle in &ptys {
        out.push(view(handle).await);
    }
    Json(out)
}

/// `GET /api/pty/{id}`
pub async fn get_pty(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<PtyView>, BoxError> {
    let handle = state
        .pty_manager
        .get(&id)
        .await
        .ok_or_else(|| BoxError::new(crate::error::ErrorCode::PtyNotFound, format!("pty {id} not found")))?;
    Ok(Json(view(&handle).await))
}

/// `DELETE /api/pty/{id}`
pub async fn delete_pty(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, BoxError> {
    state.pty_manager.remove(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct PtyInputRequest {
    pub data: String,
}

/// `POST /api/pty/{id}/input`
pub async fn pty_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PtyInputRequest>,
) -> Result<Json<serde_json::Value>, BoxError> {
    let handle = state
        .pty_manager
        .get(&id)
        .await
        .ok_or_else(|| BoxError::new(crate::error::ErrorCode::PtyNotFound, format!("pty {id} not found")))?;
    handle.write(req.data.as_bytes()).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct PtyResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/pty/{id}/resize`
pub async fn pty_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PtyResizeRequest>,
) -> Result<Json<serde_json::Value>, BoxError> {
    let handle = state
        .pty_manager
        .get(&id)
        .await
        .ok_or_else(|| BoxError::new(crate::error::ErrorCode::PtyNotFound, format!("pty {id} not found")))?;
    handle.resize(req.cols, req.rows)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `GET /api/pty/{id}/stream` — HTTP fallback for PTY output; the WS adapter
/// is the normal interactive path via `registerPtyListener`.
pub async fn stream_pty(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, BoxError> {
    let handle = state
        .pty_manager
        .get(&id)
        .await
        .ok_or_else(|| BoxError::new(crate::error::ErrorCode::PtyNotFound, format!("pty {id} not found")))?;
    state.pty_manager.cancel_disconnect_timer(&id).await;

    let output = handle.output();
    let state_rx = handle.subscribe_state();
    let guard = DisconnectTimerGuard {
        pty_manager: state.pty_manager.clone(),
        pty_id: id,
    };

    let stream = stream::unfold((output, state_rx.clone(), 0u64, guard), move |(output, mut state_rx, mut cursor, guard)| async move {
        loop {
            let (entries, notify) = {
                let buf = output.lock().await;
                if buf.has_entries_since(cursor) {
                    let (entries, _dropped) = buf.read_since(cursor);
                    (entries, None)
                } else {
                    (vec![], Some(buf.notifier()))
                }
            };
            if let Some(entry) = entries.into_iter().next() {
                cursor = entry.seq;
                return Some((
                    Ok(SseEvent::default().event("data").data(entry.data)),
                    (output, state_rx, cursor, guard),
                ));
            }
            if *state_rx.borrow() == PtyState::Exited {
                return None;
            }
            if let Some(n) = notify {
                tokio::select! {
                    () = n.notified() => {}
                    _ = state_rx.changed() => {}
                }
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Arms the PTY's disconnect timer when the last subscriber to a stream
/// goes away — dropped whenever the SSE body ends (client disconnect,
/// request-task abort on WS close, or the PTY exiting on its own).
/// Cancelled up front in [`stream_pty`] so a reattach within the window
/// doesn't race its own kill.
struct DisconnectTimerGuard {
    pty_manager: crate::pty::PtyManager,
    pty_id: String,
}

impl Drop for DisconnectTimerGuard {
    fn drop(&mut self) {
        let pty_manager = self.pty_manager.clone();
        let pty_id = self.pty_id.clone();
        tokio::spawn(async move {
            pty_manager.start_disconnect_timer(&pty_id).await;
        });
    }
}
