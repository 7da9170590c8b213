#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! termbridge library — building blocks of the terminal bridge.
//!
//! - `config` — TOML + env-var configuration
//! - `session` — terminal session lifecycle and registry
//! - `shell` — process spawning and PTY management
//! - `routes` — REST API route handlers
//! - `ws` — WebSocket session protocol
//! - `supervisor` — health-polling watchdog
//! - `util` — small shared helpers

pub mod config;
pub mod routes;
pub mod session;
pub mod shell;
pub mod supervisor;
pub mod util;
pub mod ws;

use std::sync::Arc;

pub use config::Config;
pub use session::SessionRegistry;

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// All live terminal sessions, keyed by session id.
    pub registry: SessionRegistry,
}
