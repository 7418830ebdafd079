//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::config::Config;
use crate::process::ProcessService;
use crate::pty::PtyManager;
use crate::session::SessionManager;

/// Session id bootstrapped at startup and reused whenever a caller omits
/// `sessionId`. Cannot be removed via `/api/session/delete`.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Shared application state for the boxd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Manages the pool of persistent shell sessions.
    pub session_manager: SessionManager,
    /// Background process registry layered on top of sessions.
    pub process_service: ProcessService,
    /// Interactive PTY registry.
    pub pty_manager: PtyManager,
    /// The resolved API router, set once at startup, unauthenticated (the WS
    /// control plane dispatches `request` frames through it directly — the
    /// connection is already gated by the `?token=` upgrade check). Stored
    /// behind a `OnceLock` because building the router requires a clone of
    /// this very state.
    pub router: Arc<OnceLock<axum::Router>>,
}
