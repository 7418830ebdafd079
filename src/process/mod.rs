//! Process Service: background-process records layered on sessions.
//!
//! A [`ProcessRecord`] is a session command exposed through a lifecycle
//! (`starting → running → completed | failed | killed | error`), an output
//! buffer fed by the same [`crate::session::buffer::OutputBuffer`]
//! catch-up-then-follow primitive used for PTY reattachment, and a status
//! channel subscribers can await. [`ProcessService`] owns the registry and
//! drives the state machine off the [`crate::session::events::Event`] stream
//! a [`crate::session::manager::SessionManager`] hands back for background
//! commands.
//!
//! PTY exclusion (the `PTY_EXCLUSIVE_CONTROL` check) is not wired in here —
//! [`ProcessService`] has no knowledge of [`crate::pty::PtyManager`]. The
//! composition root ([`crate::state::AppState`] plus the route handlers)
//! checks `pty_manager.has_active_pty(session_id)` before calling
//! [`ProcessService::start_process`] or a foreground exec, which avoids the
//! cyclic reference the two components would otherwise need.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BoxError, ErrorCode};
use crate::session::buffer::{OutputBuffer, OutputStream};
use crate::session::events::Event;
use crate::session::manager::SessionManager;
use crate::session::scratch::EnvOverrides;

/// Lifecycle state of a background process. Once terminal, the status never
/// transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Killed | Self::Error
        )
    }

    /// Exit-code-to-status mapping: 0 → completed, killed by signal
    /// (code > 128) → killed, anything else → failed.
    fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Completed
        } else if code > 128 {
            Self::Killed
        } else {
            Self::Failed
        }
    }
}

/// A background process record: id, command, lifecycle, buffered output.
pub struct ProcessRecord {
    pub id: String,
    pub command: String,
    pub session_id: String,
    pub command_id: String,
    pub started_at: Instant,
    ended_at: Mutex<Option<Instant>>,
    exit_code: Mutex<Option<i32>>,
    pid: Mutex<Option<u32>>,
    pub output: Arc<Mutex<OutputBuffer>>,
    status_tx: watch::Sender<ProcessStatus>,
    status_rx: watch::Receiver<ProcessStatus>,
    /// Fires once the streaming task has finished draining output and set a
    /// terminal status — the barrier `get_process` awaits so callers never
    /// observe a terminal record with incomplete buffers.
    drained: Notify,
}

impl ProcessRecord {
    pub fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    pub async fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().await
    }

    pub async fn pid(&self) -> Option<u32> {
        *self.pid.lock().await
    }

    pub async fn duration(&self) -> Duration {
        match *self.ended_at.lock().await {
            Some(end) => end.saturating_duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    /// A receiver that immediately observes the current status and wakes on
    /// every subsequent transition — registering after the process has
    /// already gone terminal still sees that value right away.
    pub fn subscribe_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_rx.clone()
    }
}

#[derive(Clone)]
pub struct ProcessService {
    processes: Arc<RwLock<HashMap<String, Arc<ProcessRecord>>>>,
    sessions: SessionManager,
    buffer_size: usize,
}

impl ProcessService {
    pub fn new(sessions: SessionManager, buffer_size: usize) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            sessions,
            buffer_size,
        }
    }

    /// Start a background process in `session_id`. The record is inserted
    /// into the registry before the `start` event arrives, so concurrent
    /// `get_process` calls see it immediately; `pid` fills in once the shell
    /// reports it.
    pub async fn start_process(
        &self,
        session_id: &str,
        command: &str,
        process_id: Option<String>,
        cwd: Option<&str>,
        env: Option<&EnvOverrides>,
    ) -> Result<Arc<ProcessRecord>, BoxError> {
        let id = process_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let command_id = format!("proc-{id}");

        if self.processes.read().await.contains_key(&id) {
            return Err(BoxError::new(
                ErrorCode::ProcessError,
                format!("process {id} already exists"),
            ));
        }

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Starting);
        let record = Arc::new(ProcessRecord {
            id: id.clone(),
            command: command.to_string(),
            session_id: session_id.to_string(),
            command_id: command_id.clone(),
            started_at: Instant::now(),
            ended_at: Mutex::new(None),
            exit_code: Mutex::new(None),
            pid: Mutex::new(None),
            output: Arc::new(Mutex::new(OutputBuffer::new(self.buffer_size))),
            status_tx,
            status_rx,
            drained: Notify::new(),
        });
        self.processes
            .write()
            .await
            .insert(id.clone(), Arc::clone(&record));

        let started = self
            .sessions
            .execute_stream_in_session(session_id, &command_id, command, cwd, env)
            .await;

        let (pid, mut rx) = match started {
            Ok((pid, _handle, rx)) => (pid, rx),
            Err(e) => {
                record.status_tx.send_replace(ProcessStatus::Error);
                *record.ended_at.lock().await = Some(Instant::now());
                record.drained.notify_waiters();
                return Err(e);
            }
        };
        *record.pid.lock().await = Some(pid);
        record.status_tx.send_replace(ProcessStatus::Running);
        info!(process_id = %id, session_id, pid, "process started");

        let rec = Arc::clone(&record);
        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Event::Start { .. } => {}
                    Event::Stdout { data } => {
                        rec.output.lock().await.push(OutputStream::Stdout, data);
                    }
                    Event::Stderr { data } => {
                        rec.output.lock().await.push(OutputStream::Stderr, data);
                    }
                    Event::Complete { exit_code, .. } => {
                        *rec.exit_code.lock().await = Some(exit_code);
                        *rec.ended_at.lock().await = Some(Instant::now());
                        rec.status_tx
                            .send_replace(ProcessStatus::from_exit_code(exit_code));
                        break;
                    }
                    Event::Error { message } => {
                        warn!(process_id = %rec.id, "process error: {message}");
                        rec.output
                            .lock()
                            .await
                            .push(OutputStream::System, message);
                        *rec.ended_at.lock().await = Some(Instant::now());
                        rec.status_tx.send_replace(ProcessStatus::Error);
                        break;
                    }
                }
            }
            sessions.mark_command_finished(&session_id, &rec.command_id).await;
            rec.drained.notify_waiters();
        });

        Ok(record)
    }

    /// Run `command` to completion without streaming — a thin wrapper over
    /// the session's foreground `exec`, for callers that just want a single
    /// synchronous result.
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        cwd: Option<&str>,
        env: Option<&EnvOverrides>,
        timeout: Option<Duration>,
    ) -> Result<crate::session::events::ExecResult, BoxError> {
        self.sessions
            .execute_in_session(session_id, command, cwd, env, timeout)
            .await
    }

    /// Fetch a process record. If it's already terminal (or about to be),
    /// await the streaming-complete barrier so callers never race the
    /// background drain task for the last chunk of output.
    pub async fn get_process(&self, id: &str) -> Result<Arc<ProcessRecord>, BoxError> {
        let record = self
            .processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BoxError::new(ErrorCode::ProcessNotFound, format!("process {id} not found")))?;

        if record.status().is_terminal() {
            // The drain task may still be mid-flight between setting status
            // and notifying; a short bounded wait lets it catch up. If it
            // already finished, `notified()` fires immediately because the
            // task calls `notify_waiters()` unconditionally after the loop.
            let _ = tokio::time::timeout(Duration::from_millis(200), record.drained.notified()).await;
        }
        Ok(record)
    }

    pub async fn list_processes(&self, status: Option<ProcessStatus>) -> Vec<Arc<ProcessRecord>> {
        self.processes
            .read()
            .await
            .values()
            .filter(|p| status.is_none_or(|s| p.status() == s))
            .cloned()
            .collect()
    }

    /// Kill a process. Routes to `SessionManager::kill_command`, which
    /// deliberately bypasses the session mutex so a kill lands even while
    /// the session is busy. A no-op (returns `false`) if the command already
    /// finished.
    pub async fn kill_process(&self, id: &str, signal: Option<&str>) -> Result<bool, BoxError> {
        let record = self
            .processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BoxError::new(ErrorCode::ProcessNotFound, format!("process {id} not found")))?;
        self.sessions
            .kill_command(&record.session_id, &record.command_id, signal)
            .await
    }

    pub async fn kill_all_processes(&self) -> usize {
        let records: Vec<_> = self.processes.read().await.values().cloned().collect();
        let mut killed = 0;
        for record in records {
            if record.status().is_terminal() {
                continue;
            }
            if let Ok(true) = self
                .sessions
                .kill_command(&record.session_id, &record.command_id, Some("SIGKILL"))
                .await
            {
                killed += 1;
            }
        }
        killed
    }

    /// Catch-up-then-follow byte stream: already-buffered output first, then
    /// everything new, closing on terminal status.
    pub async fn stream_process_logs(
        &self,
        id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<LogChunk>, BoxError> {
        let record = self
            .processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BoxError::new(ErrorCode::ProcessNotFound, format!("process {id} not found")))?;

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            let mut cursor = 0u64;
            let mut status_rx = record.subscribe_status();
            loop {
                let (entries, notify) = {
                    let buf = record.output.lock().await;
                    if buf.has_entries_since(cursor) {
                        let (entries, _dropped) = buf.read_since(cursor);
                        (entries, None)
                    } else {
                        (vec![], Some(buf.notifier()))
                    }
                };
                for entry in &entries {
                    cursor = entry.seq;
                    let chunk = match entry.stream {
                        OutputStream::Stdout => LogChunk::Stdout(entry.data.clone()),
                        OutputStream::Stderr => LogChunk::Stderr(entry.data.clone()),
                        OutputStream::System => LogChunk::System(entry.data.clone()),
                    };
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                if record.status().is_terminal() {
                    let _ = tx.send(LogChunk::Status(record.status())).await;
                    return;
                }
                if let Some(n) = notify {
                    tokio::select! {
                        () = n.notified() => {}
                        _ = status_rx.changed() => {}
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Scan already-buffered output for `pattern`, then follow the live
    /// stream until a line matches. Debounced at ~50ms so a burst of output
    /// doesn't trigger a full-buffer rescan per line.
    pub async fn wait_for_log(
        &self,
        id: &str,
        pattern: &str,
        timeout: Duration,
    ) -> Result<String, BoxError> {
        let record = self.get_process(id).await?;
        let deadline = Instant::now() + timeout;

        let mut cursor = 0u64;
        loop {
            let found = {
                let buf = record.output.lock().await;
                let (entries, _) = buf.read_since(cursor);
                let hit = entries.iter().find(|e| e.data.contains(pattern)).cloned();
                if let Some(last) = entries.last() {
                    cursor = last.seq;
                }
                hit
            };
            if let Some(entry) = found {
                return Ok(entry.data);
            }
            if record.status().is_terminal() {
                return Err(BoxError::new(
                    ErrorCode::ProcessExitedBeforeReady,
                    format!(
                        "exited before ready (exit code {})",
                        record.exit_code().await.unwrap_or(-1)
                    ),
                ));
            }
            if Instant::now() >= deadline {
                return Err(BoxError::new(
                    ErrorCode::ProcessReadyTimeout,
                    format!("waitForLog timed out after {timeout:?}"),
                ));
            }
            let notify = record.output.lock().await.notifier();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(50)), notify.notified()).await;
        }
    }

    pub async fn wait_for_exit(&self, id: &str, timeout: Duration) -> Result<i32, BoxError> {
        let record = self.get_process(id).await?;
        if record.status().is_terminal() {
            return Ok(record.exit_code().await.unwrap_or(-1));
        }
        let mut status_rx = record.subscribe_status();
        let wait = async {
            loop {
                if status_rx.borrow().is_terminal() {
                    return;
                }
                if status_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            return Err(BoxError::new(
                ErrorCode::ProcessReadyTimeout,
                format!("waitForExit timed out after {timeout:?}"),
            ));
        }
        Ok(record.exit_code().await.unwrap_or(-1))
    }
}

/// One chunk handed to a `streamProcessLogs` subscriber.
#[derive(Debug, Clone)]
pub enum LogChunk {
    Stdout(String),
    Stderr(String),
    System(String),
    Status(ProcessStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::shell::ShellTimings;

    async fn service() -> (ProcessService, SessionManager, String) {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(
            10,
            tmp.keep(),
            "/bin/sh".to_string(),
            "/tmp".to_string(),
            ShellTimings::default(),
        );
        let session_id = sessions.create_session(None, None, None, None).await.unwrap();
        (ProcessService::new(sessions.clone(), 256), sessions, session_id)
    }

    #[tokio::test]
    async fn process_is_visible_before_it_completes() {
        let (svc, sessions, session_id) = service().await;
        let record = svc
            .start_process(&session_id, "sleep 0.2; echo done", None, None, None)
            .await
            .unwrap();
        assert_eq!(svc.get_process(&record.id).await.unwrap().id, record.id);
        let exit = svc.wait_for_exit(&record.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, 0);
        sessions.delete_session(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn kill_after_completion_is_noop() {
        let (svc, sessions, session_id) = service().await;
        let record = svc.start_process(&session_id, "true", None, None, None).await.unwrap();
        svc.wait_for_exit(&record.id, Duration::from_secs(5)).await.unwrap();
        let killed = svc.kill_process(&record.id, None).await.unwrap();
        assert!(!killed);
        sessions.delete_session(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_log_matches_buffered_and_live_output() {
        let (svc, sessions, session_id) = service().await;
        let record = svc
            .start_process(&session_id, "echo ready; sleep 5", None, None, None)
            .await
            .unwrap();
        let line = svc
            .wait_for_log(&record.id, "ready", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(line, "ready");
        svc.kill_process(&record.id, Some("SIGKILL")).await.unwrap();
        sessions.delete_session(&session_id).await.unwrap();
    }
}
