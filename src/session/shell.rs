//! A persistent interactive shell backing one [`crate::state::AppState`]
//! session.
//!
//! [`ShellSession`] owns a single long-lived shell [`tokio::process::Child`]
//! (spawned via [`crate::shell::process::spawn_shell_pgroup`], so it's a
//! process group leader) and a private [`ScratchDir`]. Every command —
//! foreground `exec` or background `exec_stream` — runs by literally typing a
//! generated `sh`-compatible script fragment into the shell's stdin, the same
//! way a human would at an interactive prompt. Results come back only
//! through the filesystem artifacts that fragment writes: a shared,
//! prefix-tagged log and an atomically-written exit code (plus, for
//! background commands, a pid file/FIFO pair).
//!
//! This indirection is what gives a single persistent shell process reliable
//! stdout/stderr separation and a way to recover a background command's exit
//! code without ever holding an OS-level handle to it — the shell itself
//! might have started the command in a subshell we never got a `Child` for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{Event, ExecResult};
use super::scratch::{
    mkfifo, read_decimal_file, read_pid_from_pipe, shell_quote, validate_env_name, CommandHandle,
    EnvOverrides, ScratchDir, STDERR_PREFIX, STDOUT_PREFIX,
};
use crate::error::{BoxError, ErrorCode};
use crate::shell::process::spawn_shell_pgroup;

/// Tunable timings the shell layer needs that aren't part of one call's
/// arguments — owned by [`crate::config::Config`] and threaded down.
#[derive(Debug, Clone, Copy)]
pub struct ShellTimings {
    pub default_command_timeout: Duration,
    pub pid_pipe_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ShellTimings {
    fn default() -> Self {
        Self {
            default_command_timeout: Duration::from_secs(30),
            pid_pipe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// A live persistent shell plus its scratch directory.
///
/// At most one command runs at a time — enforced by the caller
/// ([`super::manager::SessionManager`]) serializing access through a
/// per-session mutex, not by anything in here.
pub struct ShellSession {
    pid: u32,
    pgid: u32,
    child: Mutex<Child>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    stdin_task: tokio::task::JoinHandle<()>,
    scratch: ScratchDir,
    timings: ShellTimings,
    destroying: AtomicBool,
}

impl ShellSession {
    /// Spawn the persistent shell and create its scratch directory.
    pub async fn spawn(
        session_id: &str,
        shell: &str,
        working_dir: &str,
        env: Option<&HashMap<String, String>>,
        scratch_root: &std::path::Path,
        timings: ShellTimings,
    ) -> Result<Self, BoxError> {
        let mut child = spawn_shell_pgroup(shell, working_dir, env).map_err(|e| {
            BoxError::new(
                ErrorCode::InternalError,
                format!("failed to spawn shell: {e}"),
            )
        })?;
        let pid = child.id().unwrap_or(0);
        let pgid = pid;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BoxError::new(ErrorCode::InternalError, "shell stdin not piped"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let scratch = ScratchDir::create(scratch_root, session_id)
            .await
            .map_err(|e| {
                BoxError::new(
                    ErrorCode::InternalError,
                    format!("failed to create scratch dir: {e}"),
                )
            })?;

        info!(session_id, pid, "shell session spawned");

        Ok(Self {
            pid,
            pgid,
            child: Mutex::new(child),
            stdin_tx,
            stdin_task,
            scratch,
            timings,
            destroying: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    async fn write_stdin(&self, data: &str) -> Result<(), BoxError> {
        self.stdin_tx
            .send(data.as_bytes().to_vec())
            .await
            .map_err(|_| BoxError::new(ErrorCode::CommandExecutionError, "shell stdin closed"))
    }

    /// Run `command` to completion in the foreground, waiting for its exit
    /// code and returning the full captured output.
    ///
    /// Implements spec's foreground script: redirect to temp files, capture
    /// exit code, demux into the shared binary log, delete temp files, write
    /// the exit code atomically — then read it all back and clean up.
    pub async fn exec(
        &self,
        cwd: Option<&str>,
        env: Option<&EnvOverrides>,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, BoxError> {
        if let Some(env) = env {
            for key in env.keys() {
                validate_env_name(key)?;
            }
        }

        let command_id = format!("fg-{}", Uuid::new_v4());
        let log_file = self.scratch.log_file(&command_id);
        let exit_file = self.scratch.exit_code_file(&command_id);
        let timeout = timeout.unwrap_or(self.timings.default_command_timeout);

        let script = foreground_script(&self.scratch, &command_id, cwd, env, command);
        let started = SystemTime::now();
        self.write_stdin(&script).await?;

        let exit_code = match wait_for_exit_code(&exit_file, self.timings.poll_interval, timeout).await {
            Some(code) => code,
            None => {
                self.scratch.cleanup_command(&command_id).await;
                return Err(BoxError::new(
                    ErrorCode::CommandExecutionError,
                    format!("command timed out after {timeout:?}"),
                ));
            }
        };

        let contents = tokio::fs::read(&log_file).await.unwrap_or_default();
        let (stdout, stderr) = demux_full(&contents);
        self.scratch.cleanup_command(&command_id).await;

        let duration = started.elapsed().unwrap_or_default();
        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
            duration,
            timestamp: iso8601_now(),
        })
    }

    /// Start `command` in the background, returning its pid as soon as the
    /// shell reports it over the PID FIFO (or the pid file, on fallback).
    /// Returns the [`CommandHandle`] so the caller (Process layer) can later
    /// call [`Self::watch_command`] and [`Self::kill_command`].
    pub async fn exec_stream(
        &self,
        command_id: &str,
        cwd: Option<&str>,
        env: Option<&EnvOverrides>,
        command: &str,
    ) -> Result<(u32, CommandHandle), BoxError> {
        if let Some(env) = env {
            for key in env.keys() {
                validate_env_name(key)?;
            }
        }

        let stdout_pipe = self.scratch.stdout_pipe(command_id);
        let stderr_pipe = self.scratch.stderr_pipe(command_id);
        let pid_pipe = self.scratch.pid_pipe(command_id);

        for pipe in [&stdout_pipe, &stderr_pipe, &pid_pipe] {
            mkfifo(pipe).map_err(|e| {
                BoxError::new(
                    ErrorCode::StreamStartError,
                    format!("failed to create fifo {}: {e}", pipe.display()),
                )
            })?;
        }

        let script = background_script(&self.scratch, command_id, cwd, env, command);
        self.write_stdin(&script).await?;

        let pid_file = self.scratch.pid_file(command_id);
        let pid = read_pid_from_pipe(&pid_pipe, &pid_file, self.timings.pid_pipe_timeout)
            .await
            .ok_or_else(|| {
                BoxError::new(
                    ErrorCode::StreamStartError,
                    "timed out waiting for background command pid",
                )
            })?;

        Ok((pid, self.scratch.handle(command_id)))
    }

    /// Tail a background command's shared log and exit-code file, emitting
    /// [`Event`]s as output arrives and a final [`Event::Complete`] once the
    /// exit code is observed. Always begins with `Event::Start { pid }` so
    /// subscribers learn the pid the same way a fresh `start` SSE event
    /// would report it. The returned task is detached from the shell —
    /// callers keep the `JoinHandle` only to abort early (e.g. on session
    /// destroy).
    pub fn watch_command(
        self: &Arc<Self>,
        pid: u32,
        handle: CommandHandle,
    ) -> (mpsc::Receiver<Event>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let session = Arc::clone(self);
        let poll_interval = self.timings.poll_interval;
        let task = tokio::spawn(async move {
            if tx.send(Event::Start { pid }).await.is_err() {
                return;
            }

            let started = SystemTime::now();
            let mut offset: u64 = 0;
            let mut stdout_acc = String::new();
            let mut stderr_acc = String::new();

            loop {
                if let Ok(contents) = tokio::fs::read(&handle.log_file).await {
                    if contents.len() as u64 > offset {
                        let chunk = &contents[offset as usize..];
                        let (stdout_lines, stderr_lines, consumed) = super::scratch::demux_log_chunk(chunk);
                        offset += consumed as u64;
                        for line in stdout_lines {
                            stdout_acc.push_str(&line);
                            stdout_acc.push('\n');
                            if tx.send(Event::Stdout { data: line }).await.is_err() {
                                return;
                            }
                        }
                        for line in stderr_lines {
                            stderr_acc.push_str(&line);
                            stderr_acc.push('\n');
                            if tx.send(Event::Stderr { data: line }).await.is_err() {
                                return;
                            }
                        }
                    }
                }

                if let Some(exit_code) = read_decimal_file(&handle.exit_code_file).await {
                    // Drain one last time in case the final write raced us.
                    if let Ok(contents) = tokio::fs::read(&handle.log_file).await {
                        if contents.len() as u64 > offset {
                            let chunk = &contents[offset as usize..];
                            let (stdout_lines, stderr_lines, _) = super::scratch::demux_log_chunk(chunk);
                            for line in stdout_lines {
                                stdout_acc.push_str(&line);
                                stdout_acc.push('\n');
                                let _ = tx.send(Event::Stdout { data: line }).await;
                            }
                            for line in stderr_lines {
                                stderr_acc.push_str(&line);
                                stderr_acc.push('\n');
                                let _ = tx.send(Event::Stderr { data: line }).await;
                            }
                        }
                    }
                    let aggregate = ExecResult {
                        stdout: stdout_acc,
                        stderr: stderr_acc,
                        #[allow(clippy::cast_possible_truncation)]
                        exit_code: exit_code as i32,
                        duration: started.elapsed().unwrap_or_default(),
                        timestamp: iso8601_now(),
                    };
                    let _ = tx
                        .send(Event::Complete {
                            #[allow(clippy::cast_possible_truncation)]
                            exit_code: exit_code as i32,
                            aggregate: Box::new(aggregate),
                        })
                        .await;
                    session.scratch.cleanup_command(&handle.command_id).await;
                    return;
                }

                tokio::time::sleep(poll_interval).await;
            }
        });
        (rx, task)
    }

    /// Deliver a signal to a background command's pid.
    ///
    /// `"SIGKILL"` maps to `SIGKILL`; every other value (including absence)
    /// maps to `SIGTERM`, matching the PTY layer's signal mapping convention.
    pub fn kill_command(&self, pid: u32, signal: Option<&str>) -> Result<(), BoxError> {
        let sig = if signal == Some("SIGKILL") {
            libc::SIGKILL
        } else {
            libc::SIGTERM
        };
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, sig) };
        if ret == 0 {
            Ok(())
        } else {
            Err(BoxError::new(
                ErrorCode::ProcessError,
                format!("kill({pid}, {sig}) failed: {}", std::io::Error::last_os_error()),
            ))
        }
    }

    /// Send a signal to the whole shell's process group (used for foreground
    /// Ctrl-C style interrupts delivered through a PTY, not through this
    /// pipe-backed shell — kept for parity/testing).
    pub fn send_signal(&self, signal: i32) -> Result<(), BoxError> {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pgid as i32;
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(BoxError::new(
                ErrorCode::ProcessError,
                format!("kill(-{pgid}, {signal}) failed: {}", std::io::Error::last_os_error()),
            ))
        }
    }

    /// Gracefully tear down: SIGTERM the process group, wait briefly,
    /// SIGKILL if still alive, abort the stdin task, remove the scratch dir.
    pub async fn destroy(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return;
        }
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pgid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let mut child = self.child.lock().await;
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => {}
            }
            drop(child);
            if tokio::time::Instant::now() >= deadline {
                if pgid > 0 {
                    unsafe {
                        libc::kill(-pgid, libc::SIGKILL);
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.stdin_task.abort();
        if let Err(e) = self.scratch.remove_all().await {
            warn!("failed to remove scratch dir: {e}");
        }
        debug!(pid = self.pid, "shell session destroyed");
    }
}

fn iso8601_now() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    humantime_rfc3339(now.as_secs(), now.subsec_millis())
}

/// Minimal RFC-3339 UTC timestamp formatter (no external date dependency).
fn humantime_rfc3339(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    // Civil-from-days (Howard Hinnant's algorithm).
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z")
}

/// Build the command actually handed to the shell: env overrides exported
/// first, then — if a per-call `cwd` was given — the command only runs if
/// `cd` into it succeeds. A nonexistent `cwd` logs an stderr line and exits
/// 1 without attempting `command`, per the documented failure mode.
fn apply_cwd_and_env(cwd: Option<&str>, env: Option<&EnvOverrides>, command: &str) -> String {
    let mut prefix = String::new();
    if let Some(env) = env {
        for (k, v) in env {
            prefix.push_str(&format!("export {k}={}; ", shell_quote(v)));
        }
    }
    match cwd {
        Some(dir) => {
            let quoted = shell_quote(dir);
            format!(
                "{prefix}if cd {quoted} 2>/dev/null; then {command}; else echo \"cd: {dir}: No such file or directory\" 1>&2; exit 1; fi"
            )
        }
        None => format!("{prefix}{command}"),
    }
}

fn foreground_script(
    scratch: &ScratchDir,
    command_id: &str,
    cwd: Option<&str>,
    env: Option<&EnvOverrides>,
    command: &str,
) -> String {
    let log_file = scratch.log_file(command_id).display().to_string();
    let exit_file = scratch.exit_code_file(command_id).display().to_string();
    let out_tmp = scratch.path().join(format!("{command_id}.out")).display().to_string();
    let err_tmp = scratch.path().join(format!("{command_id}.err")).display().to_string();
    let inner = apply_cwd_and_env(cwd, env, command);

    format!(
        "{{ ( {inner} ) >{out} 2>{err}; ec=$?; \
while IFS= read -r line || [ -n \"$line\" ]; do printf '\\001\\001\\001%s\\n' \"$line\"; done < {out} >> {log}; \
while IFS= read -r line || [ -n \"$line\" ]; do printf '\\002\\002\\002%s\\n' \"$line\"; done < {err} >> {log}; \
rm -f {out} {err}; printf '%s' \"$ec\" > {exit}.tmp; mv {exit}.tmp {exit}; }} 2>/dev/null\n",
        inner = inner,
        out = shell_quote(&out_tmp),
        err = shell_quote(&err_tmp),
        log = shell_quote(&log_file),
        exit = shell_quote(&exit_file),
    )
}

fn background_script(
    scratch: &ScratchDir,
    command_id: &str,
    cwd: Option<&str>,
    env: Option<&EnvOverrides>,
    command: &str,
) -> String {
    let log_file = scratch.log_file(command_id).display().to_string();
    let exit_file = scratch.exit_code_file(command_id).display().to_string();
    let pid_file = scratch.pid_file(command_id).display().to_string();
    let stdout_pipe = scratch.stdout_pipe(command_id).display().to_string();
    let stderr_pipe = scratch.stderr_pipe(command_id).display().to_string();
    let pid_pipe = scratch.pid_pipe(command_id).display().to_string();
    let labelers_done = scratch.labelers_done_marker(command_id).display().to_string();
    let inner = apply_cwd_and_env(cwd, env, command);

    format!(
        "{{ \
( while IFS= read -r line || [ -n \"$line\" ]; do printf '\\001\\001\\001%s\\n' \"$line\" >> {log}; done < {sout} ) & lo=$!; \
( while IFS= read -r line || [ -n \"$line\" ]; do printf '\\002\\002\\002%s\\n' \"$line\" >> {log}; done < {serr} ) & le=$!; \
( {inner} ) >{sout} 2>{serr} & cp=$!; \
printf '%s' \"$cp\" > {pidf}.tmp; mv {pidf}.tmp {pidf}; \
( printf '%s' \"$cp\" > {pidp} ) & \
( wait \"$cp\"; ec=$?; printf '%s' \"$ec\" > {exitf}.tmp; mv {exitf}.tmp {exitf}; wait \"$lo\" \"$le\" 2>/dev/null; rm -f {sout} {serr} {pidp}; : > {done}; ) & \
}} 2>/dev/null\n",
        log = shell_quote(&log_file),
        sout = shell_quote(&stdout_pipe),
        serr = shell_quote(&stderr_pipe),
        inner = inner,
        pidf = shell_quote(&pid_file),
        pidp = shell_quote(&pid_pipe),
        exitf = shell_quote(&exit_file),
        done = shell_quote(&labelers_done),
    )
}

/// Race a directory-change notification against a coarse poll for the exit
/// code file to appear, bounded by `timeout`. Returns `None` on timeout.
async fn wait_for_exit_code(exit_file: &std::path::Path, poll_interval: Duration, timeout: Duration) -> Option<i32> {
    let parent = exit_file.parent()?;
    let (watch_tx, mut watch_rx) = mpsc::channel::<()>(8);
    let mut watcher = match notify::recommended_watcher(move |_res: notify::Result<notify::Event>| {
        let _ = watch_tx.try_send(());
    }) {
        Ok(w) => w,
        Err(_) => return poll_for_exit_code(exit_file, poll_interval, timeout).await,
    };
    if notify::Watcher::watch(&mut watcher, parent, notify::RecursiveMode::NonRecursive).is_err() {
        return poll_for_exit_code(exit_file, poll_interval, timeout).await;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(code) = read_decimal_file(exit_file).await {
            #[allow(clippy::cast_possible_truncation)]
            return Some(code as i32);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        tokio::select! {
            _ = watch_rx.recv() => {}
            () = tokio::time::sleep(poll_interval.min(remaining)) => {}
        }
    }
}

async fn poll_for_exit_code(exit_file: &std::path::Path, poll_interval: Duration, timeout: Duration) -> Option<i32> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(code) = read_decimal_file(exit_file).await {
            #[allow(clippy::cast_possible_truncation)]
            return Some(code as i32);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn demux_full(contents: &[u8]) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for line in contents.split(|b| *b == b'\n') {
        if let Some(rest) = line.strip_prefix(&STDOUT_PREFIX) {
            stdout.push_str(&String::from_utf8_lossy(rest));
            stdout.push('\n');
        } else if let Some(rest) = line.strip_prefix(&STDERR_PREFIX) {
            stderr.push_str(&String::from_utf8_lossy(rest));
            stderr.push('\n');
        }
    }
    (stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn foreground_script_contains_expected_fragments() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(tmp.path(), "s1").await.unwrap();
        let script = foreground_script(&scratch, "fg-1", Some("/tmp"), None, "echo hi");
        assert!(script.contains("echo hi"));
        assert!(script.contains("cd "));
        assert!(script.contains(r"\001\001\001"));
        assert!(script.contains(r"\002\002\002"));
    }

    #[tokio::test]
    async fn background_script_spawns_detached() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(tmp.path(), "s1").await.unwrap();
        let script = background_script(&scratch, "bg-1", None, None, "sleep 1");
        assert!(script.contains("sleep 1"));
        assert!(script.ends_with("} 2>/dev/null\n"));
    }

    #[test]
    fn cwd_gate_skips_command_on_failed_cd() {
        let script = apply_cwd_and_env(Some("/no/such/dir"), None, "echo hi");
        assert!(script.starts_with("if cd "));
        assert!(script.contains("else echo"));
        assert!(script.contains("exit 1"));
        // `echo hi` only appears in the `then` branch, never unconditionally.
        assert!(script.contains("then echo hi;"));
    }

    #[tokio::test]
    async fn exec_fails_on_nonexistent_cwd_without_running_command() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker");
        let session = ShellSession::spawn(
            "s1",
            "/bin/sh",
            "/tmp",
            None,
            tmp.path(),
            ShellTimings::default(),
        )
        .await
        .unwrap();
        let result = session
            .exec(
                Some("/no/such/dir"),
                None,
                &format!("touch {}", marker.display()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(!result.stderr.is_empty());
        assert!(!marker.exists());
        session.destroy().await;
    }

    #[tokio::test]
    async fn exec_rejects_invalid_env_var_name() {
        let tmp = tempfile::tempdir().unwrap();
        let session = ShellSession::spawn(
            "s1",
            "/bin/sh",
            "/tmp",
            None,
            tmp.path(),
            ShellTimings::default(),
        )
        .await
        .unwrap();
        let mut env = HashMap::new();
        env.insert("1BAD".to_string(), "v".to_string());
        let err = session
            .exec(None, Some(&env), "echo hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert!(err.message.contains("1BAD"));
        session.destroy().await;
    }

    #[test]
    fn demux_full_recovers_both_streams() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&STDOUT_PREFIX);
        buf.extend_from_slice(b"hello\n");
        buf.extend_from_slice(&STDERR_PREFIX);
        buf.extend_from_slice(b"oops\n");
        let (stdout, stderr) = demux_full(&buf);
        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "oops\n");
    }
}
