//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BOXD_API_KEY`, `BOXD_LISTEN`, `BOXD_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `boxd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:1337"
//! max_sessions = 50
//! ws_request_timeout_ms = 120000
//! max_connections = 1000
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [shell]
//! default_shell = "/bin/sh"
//! default_working_dir = "/"
//! default_command_timeout_ms = 30000
//!
//! [scratch]
//! root_dir = "/var/lib/boxd/scratch"
//! pid_pipe_timeout_ms = 5000
//! labeler_done_timeout_ms = 5000
//! poll_interval_ms = 50
//!
//! [pty]
//! disconnect_timeout_ms = 30000
//! default_rows = 24
//! default_cols = 80
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub scratch: ScratchConfig,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WS server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:1337`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent sessions (default 50).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum output entries kept per process/PTY output buffer (default 2000).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Timeout for a single request/response exchange carried over the WS
    /// control-plane multiplexer, in milliseconds (default 120 000).
    #[serde(default = "default_ws_request_timeout_ms")]
    pub ws_request_timeout_ms: u64,
    /// Maximum number of requests served concurrently (default 1000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `BOXD_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Shell defaults used when requests don't specify overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary for sessions (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory for new sessions (default `/`).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
    /// Default per-command timeout in milliseconds, used when a call doesn't
    /// specify its own (default 30 000).
    #[serde(default = "default_command_timeout_ms")]
    pub default_command_timeout_ms: u64,
}

/// Scratch-directory mechanics: where per-session artifact directories live
/// and how long the various handshakes wait before giving up.
#[derive(Debug, Clone, Deserialize)]
pub struct ScratchConfig {
    /// Root directory under which each session gets `session-<id>-<ts>/`
    /// (default `/var/lib/boxd/scratch`).
    #[serde(default = "default_scratch_root")]
    pub root_dir: String,
    /// How long to wait for a background command's pid on the PID FIFO
    /// before falling back to polling the pid file (default 5000ms).
    #[serde(default = "default_pid_pipe_timeout_ms")]
    pub pid_pipe_timeout_ms: u64,
    /// How long to wait for a background command's labeler loops to finish
    /// draining after the command exits, during session destroy (default 5000ms).
    #[serde(default = "default_labeler_done_timeout_ms")]
    pub labeler_done_timeout_ms: u64,
    /// Directory-watcher/poll race interval for exit-code detection (default 50ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// PTY defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct PtyConfig {
    /// Seconds-equivalent (in ms) a PTY is kept alive after the last
    /// subscriber disconnects before it's force-killed (default 30 000).
    #[serde(default = "default_pty_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Default terminal rows (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_rows: u16,
    /// Default terminal columns (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_cols: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:1337".to_string()
}
fn default_max_sessions() -> usize {
    50
}
fn default_buffer_size() -> usize {
    2000
}
fn default_ws_request_timeout_ms() -> u64 {
    120_000
}
fn default_max_connections() -> usize {
    1000
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_working_dir() -> String {
    "/".to_string()
}
fn default_command_timeout_ms() -> u64 {
    30_000
}
fn default_scratch_root() -> String {
    "/var/lib/boxd/scratch".to_string()
}
fn default_pid_pipe_timeout_ms() -> u64 {
    5000
}
fn default_labeler_done_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_pty_disconnect_timeout_ms() -> u64 {
    30_000
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            buffer_size: default_buffer_size(),
            ws_request_timeout_ms: default_ws_request_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_working_dir: default_working_dir(),
            default_command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root_dir: default_scratch_root(),
            pid_pipe_timeout_ms: default_pid_pipe_timeout_ms(),
            labeler_done_timeout_ms: default_labeler_done_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout_ms: default_pty_disconnect_timeout_ms(),
            default_rows: default_terminal_rows(),
            default_cols: default_terminal_cols(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `boxd.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("boxd.toml").exists() {
            let content = std::fs::read_to_string("boxd.toml").expect("Failed to read boxd.toml");
            toml::from_str(&content).expect("Failed to parse boxd.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                shell: ShellConfig::default(),
                scratch: ScratchConfig::default(),
                pty: PtyConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        if let Ok(key) = std::env::var("BOXD_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("BOXD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("BOXD_DATA_DIR") {
            config.scratch.root_dir = dir;
        }

        config
    }

    /// Validate the loaded configuration, panicking with a clear message on
    /// an invalid value — fail fast at boot rather than surfacing config
    /// errors at request time.
    pub fn validate(&self) {
        assert!(
            self.server.listen.parse::<std::net::SocketAddr>().is_ok(),
            "invalid server.listen address: {}",
            self.server.listen
        );
        assert!(
            self.pty.default_rows > 0 && self.pty.default_cols > 0,
            "pty default rows/cols must be nonzero"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            shell: ShellConfig::default(),
            scratch: ScratchConfig::default(),
            pty: PtyConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.validate();
        assert_eq!(config.server.listen, "0.0.0.0:1337");
        assert_eq!(config.auth.api_key, "change-me");
    }
}
