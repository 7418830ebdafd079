//! Per-session scratch directory and the binary-log wire protocol.
//!
//! Every command a [`super::shell::ShellSession`] runs communicates with the
//! Rust side purely through files written by the shell fragment it was
//! handed: a shared, prefix-tagged log, an atomically-written exit code file,
//! and — for background commands — a pid file, a PID FIFO, and two
//! stdout/stderr FIFOs drained by "labeler" shell loops.
//!
//! ## The binary-log protocol
//!
//! `stdout` lines are appended to the command's log file prefixed with
//! [`STDOUT_PREFIX`] (`0x01 0x01 0x01`); `stderr` lines with
//! [`STDERR_PREFIX`] (`0x02 0x02 0x02`). These byte sequences essentially
//! never occur in program output, so a reader can losslessly demultiplex one
//! shared file back into two streams at line granularity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::TryFutureExt as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{BoxError, ErrorCode};

/// Tag prepended to every stdout line written to a command's shared log.
pub const STDOUT_PREFIX: [u8; 3] = [0x01, 0x01, 0x01];
/// Tag prepended to every stderr line written to a command's shared log.
pub const STDERR_PREFIX: [u8; 3] = [0x02, 0x02, 0x02];

/// A running (or just-finished) command's artifact paths within the owning
/// session's scratch directory. Presence of an entry in the session's
/// command-handle map means "this command may still be running or may have
/// just completed and not yet been cleaned up": a process record without a
/// [`CommandHandle`] is already terminal.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    pub command_id: String,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub exit_code_file: PathBuf,
}

/// A session's private, per-command scratch directory.
///
/// Created on session initialize, recursively removed on session destroy.
/// Every path handed out is unique per command id, so concurrent commands in
/// different sessions (or, for background commands, outliving a session
/// mutex release) never collide.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<root>/session-<id>-<epoch_ms>`.
    pub async fn create(root: &Path, session_id: &str) -> std::io::Result<Self> {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = root.join(format!("session-{session_id}-{epoch_ms}"));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_file(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.log"))
    }

    pub fn exit_code_file(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.exit"))
    }

    pub fn pid_file(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.pid"))
    }

    pub fn stdout_pipe(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.stdout.pipe"))
    }

    pub fn stderr_pipe(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.stderr.pipe"))
    }

    pub fn pid_pipe(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.pid.pipe"))
    }

    pub fn labelers_done_marker(&self, command_id: &str) -> PathBuf {
        self.path.join(format!("{command_id}.labelers.done"))
    }

    pub fn handle(&self, command_id: &str) -> CommandHandle {
        CommandHandle {
            command_id: command_id.to_string(),
            pid_file: self.pid_file(command_id),
            log_file: self.log_file(command_id),
            exit_code_file: self.exit_code_file(command_id),
        }
    }

    /// Remove every artifact for one command id. Errors are swallowed —
    /// cleanup runs during/after command completion and a missing file is
    /// not a failure.
    pub async fn cleanup_command(&self, command_id: &str) {
        for path in [
            self.log_file(command_id),
            self.exit_code_file(command_id),
            self.pid_file(command_id),
            self.stdout_pipe(command_id),
            self.stderr_pipe(command_id),
            self.pid_pipe(command_id),
            self.labelers_done_marker(command_id),
        ] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Recursively remove the whole directory (session destroy).
    pub async fn remove_all(&self) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(&self.path).await
    }
}

/// Create a FIFO (named pipe) at `path`. Fails if one already exists there.
pub fn mkfifo(path: &Path) -> std::io::Result<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// Write `contents` to `path` atomically: write to `path.tmp-<suffix>` then
/// rename over the target. This is what makes the exit-code and pid files
/// safe to poll — a reader never observes a partially-written file.
pub async fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        f.write_all(contents.as_bytes()).await?;
        f.flush().await?;
    }
    tokio::fs::rename(&tmp_path, path).await
}

/// Parse a prefixed binary log, splitting on `\n` and routing each line by
/// its leading 3-byte tag. Lines without a recognized prefix are dropped —
/// this should not happen if only the generated shell fragments write to the
/// log, but a corrupt/partial final line at the read boundary is handled by
/// the caller retaining the unterminated tail across polls.
pub fn demux_log_chunk(buf: &[u8]) -> (Vec<String>, Vec<String>, usize) {
    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();
    let mut consumed = 0usize;
    let mut start = 0usize;
    for (i, b) in buf.iter().enumerate() {
        if *b == b'\n' {
            let line = &buf[start..i];
            if let Some(rest) = line.strip_prefix(&STDOUT_PREFIX) {
                stdout_lines.push(String::from_utf8_lossy(rest).into_owned());
            } else if let Some(rest) = line.strip_prefix(&STDERR_PREFIX) {
                stderr_lines.push(String::from_utf8_lossy(rest).into_owned());
            }
            start = i + 1;
            consumed = start;
        }
    }
    (stdout_lines, stderr_lines, consumed)
}

/// Read `path` and parse it as a decimal integer exit code / pid, retrying
/// briefly to absorb the narrow window between `write-then-rename` create and
/// full visibility on some overlay filesystems.
pub async fn read_decimal_file(path: &Path) -> Option<i64> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    contents.trim().parse::<i64>().ok()
}

/// Read a pid from the dedicated PID FIFO, falling back to polling the pid
/// file on timeout.
///
/// Opening a FIFO for reading blocks until the other end is opened for
/// writing — exactly the synchronization primitive we want: the shell writes
/// the pid to the pipe right after spawning the background command, and
/// whichever side gets there first waits for the other.
///
/// On timeout, this function opens the pipe for **writing** itself. That
/// unblocks its own pending (blocking-pool) open-for-read call so the
/// underlying fd isn't leaked, then falls back to polling the pid file a
/// few times before giving up.
pub async fn read_pid_from_pipe(pipe_path: &Path, pid_file: &Path, timeout: std::time::Duration) -> Option<u32> {
    let pipe_path_owned = pipe_path.to_path_buf();
    let read_fut = tokio::fs::File::open(pipe_path_owned).and_then(|mut f| async move {
        let mut buf = String::new();
        f.read_to_string(&mut buf).await?;
        Ok(buf)
    });

    match tokio::time::timeout(timeout, read_fut).await {
        Ok(Ok(contents)) => contents.trim().parse::<u32>().ok(),
        Ok(Err(_)) | Err(_) => {
            // Unblock our own open-for-read by opening the write side, then
            // poll the pid file a handful of times.
            if let Ok(mut writer) = tokio::fs::OpenOptions::new().write(true).open(pipe_path).await {
                let _ = writer.write_all(b"").await;
            }
            for _ in 0..10 {
                if let Some(pid) = read_decimal_file(pid_file).await {
                    return u32::try_from(pid).ok();
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            None
        }
    }
}

/// Translate an OS validation failure for an env var name into a typed error
/// up front, before the shell fragment is ever issued.
pub fn validate_env_name(name: &str) -> Result<(), BoxError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BoxError::new(
            ErrorCode::ValidationFailed,
            format!("Invalid environment variable name: {name}"),
        ))
    }
}

/// Shell-quote a string for safe interpolation into a `sh`-compatible
/// fragment (single-quote, escaping embedded single quotes).
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Per-call environment override application, rendered as a map for the
/// script generator (kept separate so callers can validate names first).
pub type EnvOverrides = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demuxes_interleaved_lines() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&STDOUT_PREFIX);
        buf.extend_from_slice(b"out\n");
        buf.extend_from_slice(&STDERR_PREFIX);
        buf.extend_from_slice(b"err\n");
        let (stdout, stderr, consumed) = demux_log_chunk(&buf);
        assert_eq!(stdout, vec!["out".to_string()]);
        assert_eq!(stderr, vec!["err".to_string()]);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn retains_unterminated_tail() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&STDOUT_PREFIX);
        buf.extend_from_slice(b"complete\n");
        buf.extend_from_slice(&STDOUT_PREFIX);
        buf.extend_from_slice(b"partial");
        let (stdout, _stderr, consumed) = demux_log_chunk(&buf);
        assert_eq!(stdout, vec!["complete".to_string()]);
        assert!(consumed < buf.len());
    }

    #[test]
    fn rejects_invalid_env_names() {
        assert!(validate_env_name("PATH").is_ok());
        assert!(validate_env_name("_foo123").is_ok());
        assert!(validate_env_name("1BAD").is_err());
        assert!(validate_env_name("has space").is_err());
        assert!(validate_env_name("").is_err());
    }

    #[tokio::test]
    async fn scratch_dir_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(tmp.path(), "s1").await.unwrap();
        assert!(scratch.path().exists());
        atomic_write(&scratch.exit_code_file("c1"), "0").await.unwrap();
        assert_eq!(read_decimal_file(&scratch.exit_code_file("c1")).await, Some(0));
        scratch.cleanup_command("c1").await;
        assert!(!scratch.exit_code_file("c1").exists());
        scratch.remove_all().await.unwrap();
        assert!(!scratch.path().exists());
    }
}
