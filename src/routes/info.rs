//! Process metadata endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/info` — static/cheap process metadata.
///
/// Everything here is either compiled in, read from the environment, or a
/// registry count — nothing touches the disk or spawns a process.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    Json(json!({
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "shell": state.config.shell.default_shell,
        "homeDir": crate::util::home_dir(),
        "cwd": cwd,
        "activeSessions": state.registry.count().await,
    }))
}
