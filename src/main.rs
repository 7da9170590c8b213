#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # termbridge
//!
//! Remote terminal bridge: interactive shell sessions over WebSocket plus a
//! small HTTP API, with an optional supervising watchdog.
//!
//! ## Subcommands
//!
//! - `termbridge serve` (default) — run the HTTP/WS server
//! - `termbridge supervise` — run as watchdog: starts the server, health-polls
//!   it, and restarts it on crash or sustained probe failure
//!
//! ## API surface
//!
//! | Method | Path           | Description                                |
//! |--------|----------------|--------------------------------------------|
//! | GET    | `/api/health`  | Liveness probe                             |
//! | GET    | `/api/info`    | Process metadata (platform, shell, counts) |
//! | POST   | `/api/execute` | One-shot command execution                 |
//! | GET    | `/ws`          | WebSocket for interactive terminal sessions|
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! supervisor.rs    — health-polling watchdog (spawn/probe/restart loop)
//! config.rs        — TOML + env-var configuration
//! routes/
//!   health.rs      — GET /api/health
//!   info.rs        — GET /api/info
//!   execute.rs     — POST /api/execute
//! shell/
//!   process.rs     — pipe-backed spawn, exec_command()
//!   pty.rs         — PTY allocation, spawn, resize
//! session/
//!   session.rs     — TerminalSession (PTY or pipe transport, event pump)
//!   mod.rs         — SessionRegistry, session id generation
//! ws.rs            — WebSocket upgrade, frame dispatch, per-connection session
//! ```

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use termbridge::{routes, supervisor, ws, AppState, Config, SessionRegistry};

/// Remote terminal bridge server.
#[derive(Parser)]
#[command(name = "termbridge", version)]
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
    /// Run as watchdog: starts the server and restarts it on failure.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => {
            run_supervisor_mode(config.as_deref()).await;
        }
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
        }
        None => {
            run_server(None).await;
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("termbridge supervisor starting");
    supervisor::run_supervisor(config_path, &config).await
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("termbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Default shell: {}", config.shell.default_shell);

    let listen_addr = config.server.listen_addr();

    let state = AppState {
        config: Arc::new(config),
        registry: SessionRegistry::new(),
    };

    let app = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/info", get(routes::info::info))
        .route("/api/execute", post(routes::execute::execute))
        .route("/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {listen_addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("Listening on {listen_addr}");

    // Graceful shutdown on SIGINT or SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    // Cleanup: kill any shells still attached to live sessions
    info!("Shutting down...");
    state.registry.kill_all().await;
    info!("Goodbye");
}
