//! Low-level process spawning shared by the session and PTY layers.
//!
//! The persistent shell that backs every [`crate::session::shell::ShellSession`]
//! is spawned here. `kill_on_drop(true)` means an orphaned `Child` sends
//! SIGKILL on drop, and `setpgid(0, 0)` makes the shell a process group
//! leader so signals sent to `-pgid` reach the whole tree it spawns.

use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Spawn an interactive shell in its own process group with piped I/O.
///
/// Becomes a process group leader via `setpgid(0, 0)` in `pre_exec`, so
/// `kill(-pgid, signal)` reaches every descendant, not just the shell itself.
pub fn spawn_shell_pgroup(
    shell: &str,
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(shell);
    cmd.current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}
