//! Types shared between the session, process, and PTY layers for reporting
//! command progress and final results.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A progress notification emitted while a command runs. Background
/// commands (Process layer) fan these out to subscribers as they occur;
/// foreground commands (plain `exec`) only ever produce a final
/// [`ExecResult`], never these intermediate events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start { pid: u32 },
    Stdout { data: String },
    Stderr { data: String },
    Complete { exit_code: i32, aggregate: Box<ExecResult> },
    Error { message: String },
}

/// The full result of a foreground `exec` call, or the final snapshot
/// handed to a background command's subscribers on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub timestamp: String,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
