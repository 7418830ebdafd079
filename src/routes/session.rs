//! `/api/session/*` — named session lifecycle.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{BoxError, ErrorCode};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub shell: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `POST /api/session/create`
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, BoxError> {
    let session_id = state
        .session_manager
        .create_session(
            req.session_id,
            req.working_dir.as_deref(),
            req.env.as_ref(),
            req.shell.as_deref(),
        )
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteSessionRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `POST /api/session/delete` — the default session can't be removed.
pub async fn delete_session(
    State(state): State<AppState>,
    Json(req): Json<DeleteSessionRequest>,
) -> Result<Json<Value>, BoxError> {
    if req.session_id == crate::state::DEFAULT_SESSION_ID {
        return Err(BoxError::new(
            ErrorCode::ValidationFailed,
            "the default session cannot be deleted",
        ));
    }
    state.session_manager.delete_session(&req.session_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionListEntry>,
}

#[derive(Debug, Serialize)]
pub struct SessionListEntry {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub pid: u32,
}

/// `GET /api/session/list`
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    let sessions = state
        .session_manager
        .list_sessions()
        .await
        .into_iter()
        .map(|s| SessionListEntry { session_id: s.session_id, pid: s.pid })
        .collect();
    Json(SessionListResponse { sessions })
}
