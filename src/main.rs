//! # boxd
//!
//! Sandbox container runtime: HTTP + WebSocket control plane for persistent
//! shells, background processes, and interactive PTYs inside a Linux
//! container, driven by a remote orchestrator.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use boxd::{
    config::Config,
    process::ProcessService,
    pty::PtyManager,
    routes,
    session::{ShellTimings, SessionManager},
    state::{AppState, DEFAULT_SESSION_ID},
    ws, ApiKey,
};

/// Sandbox container runtime control plane.
#[derive(Parser)]
#[command(name = "boxd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => {
            let args: Vec<String> = std::env::args().collect();
            args.windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone())
        }
    };
    run_server(config_path.as_deref()).await;
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    config.validate();

    info!("boxd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set BOXD_API_KEY or update config");
    }

    let timings = ShellTimings {
        default_command_timeout: std::time::Duration::from_millis(config.shell.default_command_timeout_ms),
        pid_pipe_timeout: std::time::Duration::from_millis(config.scratch.pid_pipe_timeout_ms),
        poll_interval: std::time::Duration::from_millis(config.scratch.poll_interval_ms),
    };
    let session_manager = SessionManager::new(
        config.server.max_sessions,
        std::path::PathBuf::from(&config.scratch.root_dir),
        config.shell.default_shell.clone(),
        config.shell.default_working_dir.clone(),
        timings,
    );

    // Bootstrap the default session every bare `sessionId`-less call falls
    // back to.
    if let Err(e) = session_manager.create_session(Some(DEFAULT_SESSION_ID.to_string()), None, None, None).await {
        panic!("failed to bootstrap default session: {e}");
    }

    let process_service = ProcessService::new(session_manager.clone(), config.server.buffer_size);
    let pty_manager = PtyManager::new(config.server.buffer_size);

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        session_manager,
        process_service,
        pty_manager,
        router: Arc::new(std::sync::OnceLock::new()),
    };

    let public_routes = Router::new()
        .route("/api/ping", get(routes::health::ping))
        .route("/api/version", get(routes::health::version));

    let authed_routes = Router::new()
        .route("/api/shells", get(routes::shells::list_shells))
        .route("/api/session/create", post(routes::session::create_session))
        .route("/api/session/delete", post(routes::session::delete_session))
        .route("/api/session/list", get(routes::session::list_sessions))
        .route("/api/execute", post(routes::execute::execute))
        .route("/api/execute/stream", post(routes::execute::execute_stream))
        .route("/api/process/start", post(routes::process::start_process))
        .route("/api/process/list", get(routes::process::list_processes))
        .route("/api/process/kill-all", delete(routes::process::kill_all_processes))
        .route(
            "/api/process/{id}",
            get(routes::process::get_process).delete(routes::process::kill_process),
        )
        .route("/api/process/{id}/logs", get(routes::process::get_process_logs))
        .route("/api/process/{id}/stream", get(routes::process::stream_process_logs))
        .route("/api/process/{id}/wait-for-log", get(routes::process::wait_for_log))
        .route("/api/process/{id}/wait-for-exit", get(routes::process::wait_for_exit))
        .route(
            "/api/pty",
            post(routes::pty::create_pty).get(routes::pty::list_ptys),
        )
        .route("/api/pty/attach/{sessionId}", post(routes::pty::attach_pty))
        .route(
            "/api/pty/{id}",
            get(routes::pty::get_pty).delete(routes::pty::delete_pty),
        )
        .route("/api/pty/{id}/input", post(routes::pty::pty_input))
        .route("/api/pty/{id}/resize", post(routes::pty::pty_resize))
        .route("/api/pty/{id}/stream", get(routes::pty::stream_pty))
        .route("/api/port-watch", post(routes::port_watch::port_watch));

    // The WS adapter dispatches `request` frames through this same bare
    // router, with no auth layer — the connection is already gated by the
    // `?token=` upgrade check.
    let bare_router = public_routes
        .clone()
        .merge(authed_routes.clone())
        .with_state(state.clone());
    state
        .router
        .set(bare_router)
        .unwrap_or_else(|_| panic!("router set twice"));

    let ws_route = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/ws", get(ws::ws_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes.layer(middleware::from_fn(boxd::auth::require_api_key)))
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(state.config.server.max_connections));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    for handle in state.pty_manager.list().await {
        let _ = state.pty_manager.remove(&handle.id).await;
    }
    state.process_service.kill_all_processes().await;
    state.session_manager.shutdown_all().await;
    info!("Goodbye");
}
