//! Session layer: persistent interactive shells addressed by id.
//!
//! - [`buffer`] — the sequenced ring buffer + `Notify` catch-up-then-follow
//!   primitive shared by process log streaming and PTY reattachment.
//! - [`events`] — the `Event`/`ExecResult` types a shell reports through.
//! - [`scratch`] — per-session scratch directory and the binary-log wire
//!   protocol (`demux_log_chunk`, atomic write-then-rename, FIFOs).
//! - [`shell`] — [`shell::ShellSession`], one persistent shell process per
//!   session, running the foreground/background script generators.
//! - [`manager`] — [`manager::SessionManager`], the registry of sessions with
//!   per-session mutex serialization and create-once coordination.

pub mod buffer;
pub mod events;
pub mod manager;
pub mod scratch;
pub mod shell;

pub use manager::SessionManager;
pub use shell::{ShellSession, ShellTimings};
