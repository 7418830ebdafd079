//! PTY Manager: interactive pseudo-terminals addressed by id.
//!
//! Each [`PtyHandle`] wraps a PTY pair and shell child allocated by
//! [`crate::shell::pty`], with the master fd read side draining into an
//! [`OutputBuffer`] (the same catch-up-then-follow primitive the Process
//! layer uses for log streaming) and the write side fed by an mpsc channel,
//! mirroring [`crate::shell::pty`]'s dup'd-fd split. Disconnect/reattach is a
//! timer armed when the last subscriber detaches and cancelled when a new one
//! attaches; if it fires, the PTY is killed.
//!
//! Only one PTY may be active per session at a time — [`PtyManager::has_active_pty`]
//! is the hook the composition root uses to keep the PTY and Process/exec
//! layers from fighting over the same shell's terminal.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BoxError, ErrorCode};
use crate::session::buffer::{OutputBuffer, OutputStream};
use crate::shell::pty::{allocate_pty, resize_pty, spawn_shell_pty};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_CWD: &str = "/home/user";
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Options accepted by [`PtyManager::create`]. Any field left `None` falls
/// back to the documented default.
#[derive(Debug, Clone, Default)]
pub struct PtyOptions {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub command: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub disconnect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtyState {
    Running,
    Exited,
}

/// Terminal outcome of a PTY's shell, translated from a wait-status exit
/// code using the 128+N signal convention.
#[derive(Debug, Clone, Serialize)]
pub struct PtyExitInfo {
    pub exit_code: i32,
    pub signal: Option<String>,
}

impl PtyExitInfo {
    fn from_exit_code(exit_code: i32) -> Self {
        let signal = (exit_code > 128).then(|| signal_name(exit_code - 128));
        Self { exit_code, signal }
    }
}

fn signal_name(n: i32) -> String {
    match n {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        15 => "SIGTERM",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        8 => "SIGFPE",
        _ => return format!("SIG{n}"),
    }
    .to_string()
}

/// A live or exited PTY session.
pub struct PtyHandle {
    pub id: String,
    pub session_id: Option<String>,
    pub command: Vec<String>,
    pub cwd: String,
    pub created_at: Instant,
    size: Mutex<(u16, u16)>,
    disconnect_timeout: Duration,
    master: OwnedFd,
    writer_tx: mpsc::Sender<Vec<u8>>,
    output: Arc<Mutex<OutputBuffer>>,
    state_tx: watch::Sender<PtyState>,
    state_rx: watch::Receiver<PtyState>,
    exit_info: Mutex<Option<PtyExitInfo>>,
    disconnect_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pid: Option<u32>,
}

impl PtyHandle {
    pub fn state(&self) -> PtyState {
        *self.state_rx.borrow()
    }

    pub async fn exit_info(&self) -> Option<PtyExitInfo> {
        self.exit_info.lock().await.clone()
    }

    pub async fn size(&self) -> (u16, u16) {
        *self.size.lock().await
    }

    /// Write bytes to the shell's stdin/terminal.
    ///
    /// `Ctrl-C` (0x03), `Ctrl-Z` (0x1A), and `Ctrl-\` (0x1C) need no special
    /// handling here: the slave side's termios has `ISIG` on, same as any
    /// real terminal, so the kernel translates them into SIGINT/SIGTSTP/SIGQUIT
    /// for the foreground process group and echoes them (`^C` etc.) itself.
    /// Every byte is just forwarded to the master as-is.
    pub async fn write(&self, data: &[u8]) -> Result<(), BoxError> {
        if self.state() != PtyState::Running {
            return Err(BoxError::new(ErrorCode::PtyError, "pty is not running"));
        }
        self.writer_tx
            .send(data.to_vec())
            .await
            .map_err(|_| BoxError::new(ErrorCode::PtyError, "pty writer closed"))
    }

    /// Resize the terminal window. `1..=1000` for both dimensions, matching
    /// what real terminal emulators allow.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), BoxError> {
        if self.state() != PtyState::Running {
            return Err(BoxError::new(ErrorCode::PtyError, "pty is not running"));
        }
        if !(1..=1000).contains(&cols) || !(1..=1000).contains(&rows) {
            return Err(BoxError::new(
                ErrorCode::ValidationFailed,
                "cols and rows must be between 1 and 1000",
            ));
        }
        resize_pty(&self.master, rows, cols).map_err(|e| {
            BoxError::new(ErrorCode::PtyError, format!("resize failed: {e}"))
        })
    }

    /// Kill the shell. `"SIGKILL"` maps to signal 9, anything else (including
    /// absent) to SIGTERM (15). Sent to the whole process group — the shell
    /// is a session leader via `setsid()`, so pgid equals pid.
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), BoxError> {
        let sig = if signal == Some("SIGKILL") { libc::SIGKILL } else { libc::SIGTERM };
        if let Some(pid) = self.pid {
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(-(pid as i32), sig) };
            if ret != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) {
                return Err(BoxError::new(
                    ErrorCode::PtyError,
                    format!("kill failed: {}", std::io::Error::last_os_error()),
                ));
            }
        }
        Ok(())
    }
}

/// Registry of PTY sessions.
#[derive(Clone)]
pub struct PtyManager {
    ptys: Arc<RwLock<HashMap<String, Arc<PtyHandle>>>>,
    by_session: Arc<RwLock<HashMap<String, String>>>,
    buffer_size: usize,
}

impl PtyManager {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            ptys: Arc::new(RwLock::new(HashMap::new())),
            by_session: Arc::new(RwLock::new(HashMap::new())),
            buffer_size,
        }
    }

    /// Whether a running PTY is already attached to `session_id`.
    pub async fn has_active_pty(&self, session_id: &str) -> bool {
        let Some(id) = self.by_session.read().await.get(session_id).cloned() else {
            return false;
        };
        self.ptys
            .read()
            .await
            .get(&id)
            .is_some_and(|h| h.state() == PtyState::Running)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<PtyHandle>> {
        self.ptys.read().await.get(id).cloned()
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> Option<Arc<PtyHandle>> {
        let id = self.by_session.read().await.get(session_id).cloned()?;
        self.get(&id).await
    }

    pub async fn list(&self) -> Vec<Arc<PtyHandle>> {
        self.ptys.read().await.values().cloned().collect()
    }

    /// Allocate a PTY, spawn a login shell on its slave side, and register
    /// it. Fails with [`ErrorCode::PtyExclusiveControl`] if `session_id` is
    /// given and already has a running PTY attached.
    pub async fn create(&self, opts: PtyOptions) -> Result<Arc<PtyHandle>, BoxError> {
        if let Some(session_id) = &opts.session_id {
            if self.has_active_pty(session_id).await {
                return Err(BoxError::new(
                    ErrorCode::PtyExclusiveControl,
                    format!("session {session_id} already has an active pty"),
                ));
            }
        }

        let cols = opts.cols.unwrap_or(DEFAULT_COLS);
        let rows = opts.rows.unwrap_or(DEFAULT_ROWS);
        let command = opts.command.unwrap_or_else(|| vec!["/bin/bash".to_string()]);
        let cwd = opts.cwd.unwrap_or_else(|| DEFAULT_CWD.to_string());
        let disconnect_timeout = opts.disconnect_timeout.unwrap_or(DEFAULT_DISCONNECT_TIMEOUT);

        let pair = allocate_pty(rows, cols)
            .map_err(|e| BoxError::new(ErrorCode::PtyError, format!("openpty failed: {e}")))?;
        let shell = command.first().cloned().unwrap_or_else(|| "/bin/bash".to_string());
        let child = spawn_shell_pty(&pair, &shell, &cwd, opts.env.as_ref())
            .map_err(|e| BoxError::new(ErrorCode::PtyError, format!("spawn failed: {e}")))?;
        let pid = child.id();

        let master_raw: RawFd = pair.master.as_raw_fd();
        let writer_fd = dup_checked(master_raw)?;
        let reader_fd = dup_checked(master_raw)?;

        let master_write = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        let id = Uuid::new_v4().to_string();
        let output = Arc::new(Mutex::new(OutputBuffer::new(self.buffer_size)));
        let (state_tx, state_rx) = watch::channel(PtyState::Running);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);

        let writer_task_id = id.clone();
        tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = writer_rx.recv().await {
                if writer.write_all(&data).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
            info!(pty_id = %writer_task_id, "pty writer closed");
        });

        let reader_task_id = id.clone();
        let reader_output = Arc::clone(&output);
        tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        reader_output.lock().await.push(OutputStream::Stdout, data);
                    }
                }
            }
            info!(pty_id = %reader_task_id, "pty output closed");
        });

        let handle = Arc::new(PtyHandle {
            id: id.clone(),
            session_id: opts.session_id.clone(),
            command,
            cwd,
            created_at: Instant::now(),
            size: Mutex::new((cols, rows)),
            disconnect_timeout,
            master: pair.master,
            writer_tx,
            output,
            state_tx,
            state_rx,
            exit_info: Mutex::new(None),
            disconnect_timer: Mutex::new(None),
            pid,
        });

        let exit_task_handle = Arc::clone(&handle);
        let mut child = child;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("pty child wait error: {e}");
                    -1
                }
            };
            *exit_task_handle.exit_info.lock().await = Some(PtyExitInfo::from_exit_code(code));
            let _ = exit_task_handle.state_tx.send(PtyState::Exited);
        });

        self.ptys.write().await.insert(id.clone(), Arc::clone(&handle));
        if let Some(session_id) = &handle.session_id {
            self.by_session.write().await.insert(session_id.clone(), id.clone());
        }
        info!(pty_id = %id, ?pid, "pty created");
        Ok(handle)
    }

    /// Kill and deregister a PTY. A no-op if the id is unknown.
    pub async fn remove(&self, id: &str) -> Result<(), BoxError> {
        let handle = {
            let mut ptys = self.ptys.write().await;
            ptys.remove(id)
        };
        let Some(handle) = handle else {
            return Err(BoxError::new(ErrorCode::PtyNotFound, format!("pty {id} not found")));
        };
        if let Some(session_id) = &handle.session_id {
            self.by_session.write().await.remove(session_id);
        }
        handle.kill(Some("SIGKILL")).await?;
        handle.cancel_disconnect_timer().await;
        Ok(())
    }

    /// Arm the disconnect timer for `id`: if no new attach cancels it within
    /// the configured window, the PTY is killed and deregistered.
    pub async fn start_disconnect_timer(&self, id: &str) {
        let Some(handle) = self.get(id).await else {
            warn!(pty_id = id, "start_disconnect_timer on unknown pty");
            return;
        };
        handle.cancel_disconnect_timer().await;
        let manager = self.clone();
        let timer_id = id.to_string();
        let timeout = handle.disconnect_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!(pty_id = %timer_id, "pty disconnect timeout elapsed, killing");
            let _ = manager.remove(&timer_id).await;
        });
        *handle.disconnect_timer.lock().await = Some(task);
    }

    pub async fn cancel_disconnect_timer(&self, id: &str) {
        if let Some(handle) = self.get(id).await {
            handle.cancel_disconnect_timer().await;
        }
    }
}

impl PtyHandle {
    async fn cancel_disconnect_timer(&self) {
        if let Some(task) = self.disconnect_timer.lock().await.take() {
            task.abort();
        }
    }

    /// Subscribe to this PTY's output, catch-up-then-follow. Returns `None`
    /// only if called on a handle that has since been removed — callers hold
    /// an `Arc<PtyHandle>` so this always succeeds in practice.
    pub fn output(&self) -> Arc<Mutex<OutputBuffer>> {
        Arc::clone(&self.output)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PtyState> {
        self.state_rx.clone()
    }
}

fn dup_checked(fd: RawFd) -> Result<RawFd, BoxError> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(BoxError::new(
            ErrorCode::PtyError,
            format!("dup failed: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok(dup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_defaults_and_exclusivity() {
        let mgr = PtyManager::new(256);
        let handle = mgr
            .create(PtyOptions {
                session_id: Some("s1".to_string()),
                command: Some(vec!["/bin/sh".to_string()]),
                cwd: Some("/tmp".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(handle.size().await, (DEFAULT_COLS, DEFAULT_ROWS));
        assert!(mgr.has_active_pty("s1").await);

        let err = mgr
            .create(PtyOptions {
                session_id: Some("s1".to_string()),
                cwd: Some("/tmp".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PtyExclusiveControl);

        mgr.remove(&handle.id).await.unwrap();
        assert!(!mgr.has_active_pty("s1").await);
    }

    #[tokio::test]
    async fn resize_validates_bounds() {
        let mgr = PtyManager::new(256);
        let handle = mgr
            .create(PtyOptions { cwd: Some("/tmp".to_string()), command: Some(vec!["/bin/sh".to_string()]), ..Default::default() })
            .await
            .unwrap();
        assert!(handle.resize(0, 24).is_err());
        assert!(handle.resize(1001, 24).is_err());
        assert!(handle.resize(1000, 1000).is_ok());
        assert!(handle.resize(100, 40).is_ok());
        mgr.remove(&handle.id).await.unwrap();
    }

    #[tokio::test]
    async fn kill_marks_exited() {
        let mgr = PtyManager::new(256);
        let handle = mgr
            .create(PtyOptions { cwd: Some("/tmp".to_string()), command: Some(vec!["/bin/sh".to_string()]), ..Default::default() })
            .await
            .unwrap();
        handle.kill(Some("SIGKILL")).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.state() == PtyState::Running && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.state(), PtyState::Exited);
    }
}
