//! `/api/ping` and `/api/version` — unauthenticated health/versioning.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/ping` — liveness probe. No authentication required, suitable
/// for load-balancer health checks.
pub async fn ping(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.session_manager.session_count().await;
    Json(json!({
        "status": "ok",
        "uptimeSeconds": uptime,
        "sessions": sessions,
    }))
}

/// `GET /api/version`
pub async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
