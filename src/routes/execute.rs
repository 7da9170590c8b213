//! One-shot command execution endpoint.
//!
//! `POST /api/execute` runs a command to completion via the shell and returns
//! the captured output. It is stateless and independent of the WebSocket
//! sessions: killing a session never cancels an in-flight execute, and each
//! request carries its own timeout.
//!
//! A failed command — timeout, spawn error, non-zero exit — always comes back
//! as HTTP 200 with `success: false`. Callers script against the JSON body,
//! not HTTP status codes.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::shell::process::{self, ExecError};
use crate::AppState;

/// Request body for `POST /api/execute`.
///
/// Only `command` is required — all other fields fall back to server config
/// defaults when omitted.
#[derive(Deserialize)]
pub struct ExecuteRequest {
    /// Shell command string (passed to `<shell> -c`).
    pub command: String,
    /// Working directory override (tilde-expanded).
    pub cwd: Option<String>,
    /// Per-request timeout in milliseconds. Defaults to `execute.timeout_ms`.
    pub timeout: Option<u64>,
    /// Extra environment variables merged into the inherited environment.
    pub env: Option<HashMap<String, String>>,
    /// Override the shell binary (e.g. `/bin/bash`).
    pub shell: Option<String>,
}

/// `POST /api/execute` — run a command to completion and capture its output.
///
/// Response: `{"success": bool, "output": string, "exitCode": number|"timeout"}`.
pub async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Json<Value> {
    let timeout = payload.timeout.unwrap_or(state.config.execute.timeout_ms);
    let shell = payload
        .shell
        .as_deref()
        .unwrap_or(&state.config.shell.default_shell);
    let raw_dir = payload
        .cwd
        .as_deref()
        .unwrap_or(&state.config.shell.default_working_dir);
    let expanded_dir = crate::util::expand_tilde(raw_dir);

    match Box::pin(process::exec_command(
        shell,
        expanded_dir.as_ref(),
        &payload.command,
        timeout,
        state.config.execute.max_output_bytes,
        payload.env.as_ref(),
    ))
    .await
    {
        Ok(result) => Json(json!({
            "success": result.exit_code == 0,
            "output": result.output,
            "exitCode": result.exit_code,
            "durationMs": result.duration_ms,
        })),
        Err(ExecError::Timeout) => {
            warn!("Execute timed out after {timeout}ms: {}", payload.command);
            Json(json!({
                "success": false,
                "output": format!("Command timed out after {timeout}ms"),
                "exitCode": "timeout",
            }))
        }
        Err(e) => {
            warn!("Execute failed: {e}");
            Json(json!({
                "success": false,
                "output": e.to_string(),
                "exitCode": -1,
            }))
        }
    }
}
