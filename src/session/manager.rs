//! Session lifecycle management: the single authority for creating,
//! accessing, and destroying [`ShellSession`]s.
//!
//! An `RwLock<HashMap<...>>` registry, write lock held across the
//! limit-check-then-insert on create to avoid TOCTOU races. Every command on
//! a session is serialized through that session's own `tokio::sync::Mutex`,
//! while `kill_command` deliberately bypasses it so a kill can land
//! mid-command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{Event, ExecResult};
use super::scratch::{CommandHandle, EnvOverrides};
use super::shell::{ShellSession, ShellTimings};
use crate::error::{BoxError, ErrorCode};

/// A registered session: the shell itself plus the mutex serializing access
/// to it, and bookkeeping for commands currently running in the background.
struct SessionEntry {
    shell: Arc<ShellSession>,
    mutex: Arc<Mutex<()>>,
    running_commands: Mutex<HashMap<String, u32>>,
}

/// Summary row for `GET`-style session listings.
pub struct SessionListItem {
    pub session_id: String,
    pub pid: u32,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionEntry>>>>,
    /// In-flight creation futures, keyed by session id, so concurrent
    /// `create_session` calls for the same id await the same spawn instead
    /// of racing to create duplicates.
    in_flight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Notify>>>>,
    max_sessions: usize,
    scratch_root: std::path::PathBuf,
    default_shell: String,
    default_working_dir: String,
    timings: ShellTimings,
}

impl SessionManager {
    pub fn new(
        max_sessions: usize,
        scratch_root: std::path::PathBuf,
        default_shell: String,
        default_working_dir: String,
        timings: ShellTimings,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            max_sessions,
            scratch_root,
            default_shell,
            default_working_dir,
            timings,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list_sessions(&self) -> Vec<SessionListItem> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionListItem {
                session_id: id.clone(),
                pid: entry.shell.pid(),
            })
            .collect()
    }

    /// Create a session with the given id (generating a uuid if `None`),
    /// failing with `SESSION_ALREADY_EXISTS` if one is already live.
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        working_dir: Option<&str>,
        env: Option<&HashMap<String, String>>,
        shell: Option<&str>,
    ) -> Result<String, BoxError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.sessions.read().await.contains_key(&session_id) {
            return Err(BoxError::new(
                ErrorCode::SessionAlreadyExists,
                format!("session {session_id} already exists"),
            ));
        }

        // If another caller is already creating this exact session id, wait
        // for it to finish rather than racing to spawn a second shell.
        let already_in_flight = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&session_id) {
                Some(Arc::clone(existing))
            } else {
                in_flight.insert(session_id.clone(), Arc::new(tokio::sync::Notify::new()));
                None
            }
        };
        if let Some(notify) = already_in_flight {
            notify.notified().await;
            return if self.sessions.read().await.contains_key(&session_id) {
                Err(BoxError::new(
                    ErrorCode::SessionAlreadyExists,
                    format!("session {session_id} already exists"),
                ))
            } else {
                // The other attempt failed; this caller gives up rather than
                // retrying, to keep this function non-recursive.
                Err(BoxError::new(
                    ErrorCode::InternalError,
                    format!("concurrent creation of session {session_id} failed"),
                ))
            };
        }

        if self.sessions.read().await.len() >= self.max_sessions {
            let notify = self.in_flight.lock().await.remove(&session_id);
            if let Some(n) = notify {
                n.notify_waiters();
            }
            return Err(BoxError::new(
                ErrorCode::ValidationFailed,
                format!("max_sessions ({}) reached", self.max_sessions),
            ));
        }

        let result = ShellSession::spawn(
            &session_id,
            shell.unwrap_or(&self.default_shell),
            working_dir.unwrap_or(&self.default_working_dir),
            env,
            &self.scratch_root,
            self.timings,
        )
        .await;

        let notify = self.in_flight.lock().await.remove(&session_id);

        let shell = match result {
            Ok(s) => s,
            Err(e) => {
                if let Some(n) = notify {
                    n.notify_waiters();
                }
                return Err(e);
            }
        };

        let entry = Arc::new(SessionEntry {
            shell: Arc::new(shell),
            mutex: Arc::new(Mutex::new(())),
            running_commands: Mutex::new(HashMap::new()),
        });
        self.sessions.write().await.insert(session_id.clone(), entry);
        if let Some(n) = notify {
            n.notify_waiters();
        }
        info!(session_id, "session created");
        Ok(session_id)
    }

    async fn get_entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, BoxError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BoxError::new(ErrorCode::CommandNotFound, format!("session {session_id} not found")))
    }

    /// Run `command` to completion under the session's mutex.
    pub async fn execute_in_session(
        &self,
        session_id: &str,
        command: &str,
        cwd: Option<&str>,
        env: Option<&EnvOverrides>,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, BoxError> {
        let entry = self.get_entry(session_id).await?;
        let _guard = entry.mutex.lock().await;
        entry.shell.exec(cwd, env, command, timeout).await
    }

    /// Hold the session mutex across an arbitrary closure — used for atomic
    /// multi-step sequences like `set_env_vars`.
    pub async fn with_session<F, T>(&self, session_id: &str, f: F) -> Result<T, BoxError>
    where
        F: for<'a> FnOnce(&'a ShellSession) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, BoxError>> + Send + 'a>>,
    {
        let entry = self.get_entry(session_id).await?;
        let _guard = entry.mutex.lock().await;
        f(&entry.shell).await
    }

    pub async fn set_env_vars(&self, session_id: &str, vars: &EnvOverrides) -> Result<(), BoxError> {
        for key in vars.keys() {
            super::scratch::validate_env_name(key)?;
        }
        let entry = self.get_entry(session_id).await?;
        let _guard = entry.mutex.lock().await;
        let assignments = vars
            .iter()
            .map(|(k, v)| format!("export {k}={}", super::scratch::shell_quote(v)))
            .collect::<Vec<_>>()
            .join("; ");
        entry.shell.exec(None, None, &format!("{assignments}\n"), None).await?;
        Ok(())
    }

    /// Start `command` in the background. Holds the session mutex only
    /// until the `start` event (pid known), then releases it — the
    /// continuation streams independently.
    pub async fn execute_stream_in_session(
        &self,
        session_id: &str,
        command_id: &str,
        command: &str,
        cwd: Option<&str>,
        env: Option<&EnvOverrides>,
    ) -> Result<(u32, CommandHandle, tokio::sync::mpsc::Receiver<Event>), BoxError> {
        let entry = self.get_entry(session_id).await?;
        let guard = entry.mutex.lock().await;
        let (pid, handle) = entry.shell.exec_stream(command_id, cwd, env, command).await?;
        entry
            .running_commands
            .lock()
            .await
            .insert(command_id.to_string(), pid);
        drop(guard);

        let (rx, _task) = entry.shell.watch_command(pid, handle.clone());
        Ok((pid, handle, rx))
    }

    /// Kill a running background command by id. Does **not** acquire the
    /// session mutex — a kill must land even while the session is busy with
    /// something else.
    pub async fn kill_command(&self, session_id: &str, command_id: &str, signal: Option<&str>) -> Result<bool, BoxError> {
        let entry = self.get_entry(session_id).await?;
        let pid = entry.running_commands.lock().await.get(command_id).copied();
        match pid {
            Some(pid) => {
                entry.shell.kill_command(pid, signal)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn mark_command_finished(&self, session_id: &str, command_id: &str) {
        if let Ok(entry) = self.get_entry(session_id).await {
            entry.running_commands.lock().await.remove(command_id);
        }
    }

    pub async fn get_session_pid(&self, session_id: &str) -> Result<u32, BoxError> {
        Ok(self.get_entry(session_id).await?.shell.pid())
    }

    /// Destroy a session: kill all tracked background commands, tear down
    /// the shell, remove the scratch directory, drop the registry entry.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), BoxError> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| BoxError::new(ErrorCode::CommandNotFound, format!("session {session_id} not found")))?
        };

        for (command_id, pid) in entry.running_commands.lock().await.iter() {
            if let Err(e) = entry.shell.kill_command(*pid, Some("SIGKILL")) {
                warn!("failed to kill command {command_id} during session destroy: {e}");
            }
        }

        entry.shell.destroy().await;
        info!(session_id, "session destroyed");
        Ok(())
    }

    pub async fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Drain all sessions — used on graceful shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.delete_session(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let tmp = tempfile::tempdir().unwrap();
        SessionManager::new(
            10,
            tmp.keep(),
            "/bin/sh".to_string(),
            "/tmp".to_string(),
            ShellTimings::default(),
        )
    }

    #[tokio::test]
    async fn create_then_delete_roundtrip() {
        let mgr = manager();
        let id = mgr.create_session(None, None, None, None).await.unwrap();
        assert!(mgr.session_exists(&id).await);
        mgr.delete_session(&id).await.unwrap();
        assert!(!mgr.session_exists(&id).await);
    }

    #[tokio::test]
    async fn duplicate_session_id_rejected() {
        let mgr = manager();
        let id = mgr
            .create_session(Some("dup".into()), None, None, None)
            .await
            .unwrap();
        let err = mgr.create_session(Some(id), None, None, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionAlreadyExists);
    }

    #[tokio::test]
    async fn exec_reports_separated_streams() {
        let mgr = manager();
        let id = mgr.create_session(None, None, None, None).await.unwrap();
        let result = mgr
            .execute_in_session(&id, "echo out; echo err 1>&2", None, None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 0);
        mgr.delete_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn state_persists_across_calls() {
        let mgr = manager();
        let id = mgr.create_session(None, None, None, None).await.unwrap();
        mgr.execute_in_session(&id, "cd /tmp && export K=v", None, None, None)
            .await
            .unwrap();
        let result = mgr
            .execute_in_session(&id, "echo $K; pwd", None, None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "v\n/tmp\n");
        mgr.delete_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn background_stream_starts_with_pid_event() {
        let mgr = manager();
        let id = mgr.create_session(None, None, None, None).await.unwrap();
        let (pid, _handle, mut rx) = mgr
            .execute_stream_in_session(&id, "c1", "sleep 0.2", None, None)
            .await
            .unwrap();
        match rx.recv().await {
            Some(Event::Start { pid: event_pid }) => assert_eq!(event_pid, pid),
            other => panic!("expected Start event first, got {other:?}"),
        }
        mgr.delete_session(&id).await.unwrap();
    }
}
