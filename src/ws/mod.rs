//! WebSocket control-plane multiplexer.
//!
//! One socket carries many concurrent logical HTTP request/response
//! exchanges plus PTY I/O, so a client that can't afford many sub-requests
//! (e.g. CGNAT'd, or just wanting one persistent connection) still gets the
//! full API.
//!
//! ## Message model (JSON frames)
//!
//! Client → server:
//! - `request{id, method, path, body?, headers?}`
//! - `pty_input{ptyId, data}`
//! - `pty_resize{ptyId, cols, rows}`
//!
//! Server → client:
//! - `response{id, status, body?, done}`
//! - `stream{id, event?, data}`
//! - `error{id?, code, message, status}`
//!
//! ## Routing
//!
//! A `request` frame is turned into a real `http::Request` and dispatched
//! through the same [`axum::Router`] the HTTP surface serves, via
//! [`tower::ServiceExt::oneshot`]. If the response's `Content-Type` is
//! `text/event-stream` the body is parsed incrementally as SSE and each
//! parsed event becomes a `stream` frame tagged with the request id,
//! followed by a final `response{done:true}` once the body ends. Otherwise
//! the body is read to completion and returned as one `response{done:true}`.
//!
//! This is also how PTY output reaches a WS client — there's no bespoke
//! "register a PTY listener" message type. A client sends
//! `request{method:"GET", path:"/api/pty/<id>/stream"}` like any other
//! streaming endpoint, and the SSE bridge above forwards the PTY's output
//! as `stream` frames for as long as the request task lives.
//!
//! Every spawned request task is tracked for the lifetime of the
//! connection; on disconnect all of them are aborted, which tears down any
//! outstanding PTY/process stream subscriptions along with it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{info, warn};

use crate::error::BoxError;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (browsers can't set headers on a
    /// WebSocket upgrade).
    pub token: String,
}

/// `GET /ws` (alias `/api/ws`) — WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
    {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
    },
    PtyInput {
        #[serde(rename = "ptyId")]
        pty_id: String,
        data: String,
    },
    PtyResize {
        #[serde(rename = "ptyId")]
        pty_id: String,
        cols: u16,
        rows: u16,
    },
}

/// Parse one incoming text frame, distinguishing malformed JSON
/// (`PARSE_ERROR`) from syntactically valid JSON that doesn't match any
/// known frame shape (`INVALID_REQUEST`).
fn parse_client_frame(text: &str) -> Result<ClientFrame, BoxError> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        BoxError::new(crate::error::ErrorCode::ParseError, format!("invalid json: {e}"))
    })?;
    serde_json::from_value(value).map_err(|e| {
        BoxError::new(
            crate::error::ErrorCode::InvalidRequest,
            format!("unknown message shape: {e}"),
        )
    })
}

fn send_error(ws_tx: &mpsc::Sender<Value>, id: Option<&str>, err: &BoxError) {
    let mut frame = json!({
        "type": "error",
        "code": err.code.as_str(),
        "message": err.message,
        "status": err.status().as_u16(),
    });
    if let Some(id) = id {
        frame["id"] = json!(id);
    }
    let _ = ws_tx.try_send(frame);
}

/// Main WebSocket event loop: splits the socket, funnels all outgoing frames
/// through one mpsc channel, and spawns one task per `request` frame.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (ws_tx, mut ws_rx) = mpsc::channel::<Value>(256);

    let outbound = tokio::spawn(async move {
        while let Some(frame) = ws_rx.recv().await {
            let text = frame.to_string();
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>> = Arc::new(Mutex::new(HashMap::new()));

    while let Some(Ok(msg)) = ws_stream.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let frame: ClientFrame = match parse_client_frame(&text) {
            Ok(f) => f,
            Err(e) => {
                send_error(&ws_tx, None, &e);
                continue;
            }
        };

        match frame {
            ClientFrame::Request { id, method, path, body, headers } => {
                let state = state.clone();
                let ws_tx = ws_tx.clone();
                let timeout = std::time::Duration::from_millis(state.config.server.ws_request_timeout_ms);
                let handle = tokio::spawn(async move {
                    let result = tokio::time::timeout(
                        timeout,
                        dispatch_request(&state, &id, &method, &path, body, headers, &ws_tx),
                    )
                    .await;
                    if result.is_err() {
                        send_error(
                            &ws_tx,
                            Some(&id),
                            &BoxError::new(crate::error::ErrorCode::InternalError, "request timed out"),
                        );
                    }
                });
                pending.lock().await.insert(id, handle);
            }
            ClientFrame::PtyInput { pty_id, data } => {
                if let Err(e) = handle_pty_input(&state, &pty_id, &data).await {
                    send_error(&ws_tx, None, &e);
                }
            }
            ClientFrame::PtyResize { pty_id, cols, rows } => {
                if let Err(e) = handle_pty_resize(&state, &pty_id, cols, rows).await {
                    send_error(&ws_tx, None, &e);
                }
            }
        }

        // Reap finished request tasks so the map doesn't grow unbounded over
        // a long-lived connection.
        pending.lock().await.retain(|_, h| !h.is_finished());
    }

    // Connection closed: every pending request's stream is torn down, which
    // also unwinds any PTY/process subscription it held.
    for (_, handle) in pending.lock().await.drain() {
        handle.abort();
    }
    outbound.abort();
    info!("ws connection closed");
}

async fn handle_pty_input(state: &AppState, pty_id: &str, data: &str) -> Result<(), BoxError> {
    let handle = state.pty_manager.get(pty_id).await.ok_or_else(|| {
        warn!(pty_id, "pty_input for unknown pty");
        BoxError::new(crate::error::ErrorCode::PtyError, format!("pty {pty_id} not found"))
    })?;
    handle.write(data.as_bytes()).await
}

async fn handle_pty_resize(state: &AppState, pty_id: &str, cols: u16, rows: u16) -> Result<(), BoxError> {
    let handle = state.pty_manager.get(pty_id).await.ok_or_else(|| {
        warn!(pty_id, "pty_resize for unknown pty");
        BoxError::new(crate::error::ErrorCode::PtyError, format!("pty {pty_id} not found"))
    })?;
    handle.resize(cols, rows)
}

/// Convert a `request` frame into a real HTTP request, dispatch it through
/// the shared router, and forward the response (or its SSE body) as
/// `stream`/`response` frames tagged with `id`.
async fn dispatch_request(
    state: &AppState,
    id: &str,
    method: &str,
    path: &str,
    body: Option<Value>,
    headers: Option<HashMap<String, String>>,
    ws_tx: &mpsc::Sender<Value>,
) {
    let Some(router) = state.router.get() else {
        send_error(ws_tx, Some(id), &BoxError::new(crate::error::ErrorCode::InternalError, "router not ready"));
        return;
    };

    let method = match method.parse::<axum::http::Method>() {
        Ok(m) => m,
        Err(_) => {
            send_error(ws_tx, Some(id), &BoxError::new(crate::error::ErrorCode::InvalidRequest, format!("bad method: {method}")));
            return;
        }
    };

    let body_bytes = body.map(|b| b.to_string()).unwrap_or_default();
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(headers) = headers {
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(k.as_str()),
                HeaderValue::try_from(v.as_str()),
            ) {
                builder = builder.header(name, value);
            }
        }
    }
    if !body_bytes.is_empty() {
        builder = builder.header(axum::http::header::CONTENT_TYPE, "application/json");
    }
    let request = match builder.body(Body::from(body_bytes)) {
        Ok(r) => r,
        Err(e) => {
            send_error(ws_tx, Some(id), &BoxError::new(crate::error::ErrorCode::InvalidRequest, format!("bad request: {e}")));
            return;
        }
    };

    let response = match router.clone().oneshot(request).await {
        Ok(r) => r,
        Err(e) => {
            send_error(ws_tx, Some(id), &BoxError::new(crate::error::ErrorCode::InternalError, e.to_string()));
            return;
        }
    };

    let status = response.status().as_u16();
    let is_event_stream = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if is_event_stream {
        stream_sse_body(id, status, response, ws_tx).await;
        return;
    }

    let bytes = match axum::body::to_bytes(response.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            send_error(ws_tx, Some(id), &BoxError::new(crate::error::ErrorCode::InternalError, e.to_string()));
            return;
        }
    };
    let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    let _ = ws_tx
        .send(json!({ "type": "response", "id": id, "status": status, "body": parsed, "done": true }))
        .await;
}

/// Incrementally parse an SSE body (`event:`/`data:` lines, blank-line
/// separated, `id:`/`retry:`/comments ignored) and forward each event as a
/// `stream` frame, finishing with `response{done:true}`.
async fn stream_sse_body(id: &str, status: u16, response: Response, ws_tx: &mpsc::Sender<Value>) {
    let mut body = response.into_body().into_data_stream();
    let mut buf = String::new();
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    loop {
        match body.next().await {
            Some(Ok(chunk)) => {
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if line.is_empty() {
                        if !data_lines.is_empty() {
                            let data = data_lines.join("\n");
                            let mut frame = json!({ "type": "stream", "id": id, "data": data });
                            if let Some(ev) = event_name.take() {
                                frame["event"] = json!(ev);
                            }
                            if ws_tx.send(frame).await.is_err() {
                                return;
                            }
                            data_lines.clear();
                        }
                        event_name = None;
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("event:") {
                        event_name = Some(rest.trim().to_string());
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data_lines.push(rest.trim_start().to_string());
                    }
                    // `id:`, `retry:`, and `:`-prefixed comments are ignored.
                }
            }
            Some(Err(_)) | None => break,
        }
    }

    let _ = ws_tx
        .send(json!({ "type": "response", "id": id, "status": status, "done": true }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_client_frame("{not json").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ParseError);
    }

    #[test]
    fn unknown_frame_shape_is_invalid_request() {
        let err = parse_client_frame(r#"{"type":"not_a_real_type"}"#).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidRequest);
    }

    #[test]
    fn valid_request_frame_parses() {
        let frame = parse_client_frame(r#"{"type":"request","id":"r1","method":"GET","path":"/a"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Request { .. }));
    }
}
