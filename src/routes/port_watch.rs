//! `/api/port-watch` — `waitForPort`: poll a local port until it accepts
//! connections (`tcp` mode) or answers with an expected HTTP status
//! (`http` mode), streaming `watching | ready | process_exited | error`.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::BoxError;
use crate::AppState;

fn default_interval_ms() -> u64 {
    250
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_mode() -> String {
    "tcp".to_string()
}
fn default_path() -> String {
    "/".to_string()
}
fn default_status() -> u16 {
    200
}

#[derive(Debug, Deserialize)]
pub struct PortWatchRequest {
    pub port: u16,
    #[serde(rename = "processId")]
    pub process_id: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(rename = "intervalMs", default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(rename = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

enum Outcome {
    Watching,
    Ready,
    ProcessExited(i32),
    TimedOut,
}

/// One GET over a bare `TcpStream` to `127.0.0.1:port`, true if it returns
/// the expected status line. Mirrors the hand-rolled HTTP framing the tunnel
/// relay client uses for its own proxied connections.
async fn http_probe(port: u16, path: &str, expected_status: u16) -> bool {
    let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await else {
        return false;
    };
    let request = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n");
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 512];
    let Ok(n) = stream.read(&mut buf).await else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..n]);
    head.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| code == expected_status)
}

async fn tcp_probe(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// `POST /api/port-watch`
pub async fn port_watch(
    State(state): State<AppState>,
    Json(req): Json<PortWatchRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, BoxError> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(req.timeout_ms);
    let process_service = state.process_service.clone();

    let stream = stream::unfold(
        (req, process_service, deadline, false),
        move |(req, process_service, deadline, done)| async move {
            if done {
                return None;
            }

            let outcome = loop {
                if let Some(process_id) = &req.process_id {
                    if let Ok(record) = process_service.get_process(process_id).await {
                        if record.status().is_terminal() {
                            break Outcome::ProcessExited(record.exit_code().await.unwrap_or(-1));
                        }
                    }
                }

                let reached = if req.mode == "http" {
                    http_probe(req.port, &req.path, req.status).await
                } else {
                    tcp_probe(req.port).await
                };
                if reached {
                    break Outcome::Ready;
                }

                if tokio::time::Instant::now() >= deadline {
                    break Outcome::TimedOut;
                }
                tokio::time::sleep(Duration::from_millis(req.interval_ms)).await;
                break Outcome::Watching;
            };

            let (event, data, terminal) = match &outcome {
                Outcome::Watching => ("watching", serde_json::json!({ "port": req.port }), false),
                Outcome::Ready => ("ready", serde_json::json!({ "port": req.port }), true),
                Outcome::ProcessExited(code) => {
                    ("process_exited", serde_json::json!({ "exitCode": code }), true)
                }
                Outcome::TimedOut => {
                    ("error", serde_json::json!({ "code": "PROCESS_READY_TIMEOUT", "message": "timed out waiting for port" }), true)
                }
            };
            let sse = Ok(SseEvent::default().event(event).data(data.to_string()));
            Some((sse, (req, process_service, deadline, terminal)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
