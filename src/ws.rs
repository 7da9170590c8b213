//! WebSocket transport for interactive terminal sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws`. The server immediately spawns a shell
//!    session (default shell, user home, 80×24), registers it, and replies
//!    with a `connected` frame carrying the session ID.
//! 2. All messages are newline-free JSON objects with a `"type"` field.
//! 3. On disconnect (close or error) the session is killed and unregistered,
//!    exactly once, even when close and process exit race.
//!
//! ## Message types (client → server)
//!
//! | Type     | Fields         | Effect                                    |
//! |----------|----------------|-------------------------------------------|
//! | `input`  | `data`         | Write raw bytes to the process            |
//! | `resize` | `cols`, `rows` | Resize the PTY (missing fields → 80×24)   |
//! | `kill`   | —              | Kill the process, unregister the session  |
//!
//! Unknown types and malformed JSON are logged and ignored — not a protocol
//! error, for forward compatibility.
//!
//! ## Message types (server → client)
//!
//! | Type        | Key fields                            |
//! |-------------|---------------------------------------|
//! | `connected` | `sessionId`, `shell`, `cwd`, `platform` |
//! | `output`    | `sessionId`, `data`                   |
//! | `exit`      | `sessionId`, `code`, `signal` — exactly once, always last |
//! | `error`     | `message`                             |

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::session::{generate_session_id, SessionEvent, TerminalSession};
use crate::AppState;

/// `GET /ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Build the `connected` frame sent once per connection.
fn connected_frame(session_id: &str, shell: &str, cwd: &str) -> Value {
    json!({
        "type": "connected",
        "sessionId": session_id,
        "shell": shell,
        "cwd": cwd,
        "platform": std::env::consts::OS,
    })
}

/// Build an `output` frame for a chunk of process output.
fn output_frame(session_id: &str, data: &str) -> Value {
    json!({
        "type": "output",
        "sessionId": session_id,
        "data": data,
    })
}

/// Build the single terminal `exit` frame. `signal` is a number when the
/// process died to a signal, `null` otherwise.
fn exit_frame(session_id: &str, code: i32, signal: Option<i32>) -> Value {
    json!({
        "type": "exit",
        "sessionId": session_id,
        "code": code,
        "signal": signal,
    })
}

/// Build an `error` frame. Errors are contained to the connection — the
/// socket stays open and the client decides whether to retry or close.
fn error_frame(message: &str) -> Value {
    json!({
        "type": "error",
        "message": message,
    })
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink (outgoing) and stream (incoming). Outgoing
/// frames are funneled through an mpsc channel so the session event pump and
/// the dispatch loop can both send without sharing the sink.
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Channel for sending frames back to the WebSocket
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    // Task: forward channel frames to the WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize frame: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Spawn the session synchronously with the connection
    let shell = state.config.shell.default_shell.clone();
    let cwd = crate::util::expand_tilde(&state.config.shell.default_working_dir).into_owned();
    let session_id = generate_session_id();

    let (session, mut events) =
        match TerminalSession::spawn(session_id.clone(), &shell, &cwd, 80, 24, None) {
            Ok((session, events)) => (Arc::new(session), events),
            Err(e) => {
                error!("WS connect: {e}");
                let _ = tx.send(error_frame(&e.to_string())).await;
                // Connection stays open with no session; drain client frames
                // until it closes so the client can decide what to do.
                while let Some(Ok(msg)) = ws_stream.next().await {
                    if matches!(msg, axum::extract::ws::Message::Close(_)) {
                        break;
                    }
                }
                send_task.abort();
                return;
            }
        };

    if let Err(e) = state.registry.register(Arc::clone(&session)).await {
        // Defensive: the ID scheme makes this unreachable in practice
        error!("WS connect: {e}");
        let _ = tx.send(error_frame(&e.to_string())).await;
        session.kill();
        send_task.abort();
        return;
    }

    info!(
        "Session {session_id} connected (shell {shell}, pid {}, {})",
        session.pid,
        if session.is_pty() { "pty" } else { "pipe" }
    );
    let _ = tx.send(connected_frame(&session_id, &shell, &cwd)).await;

    // Guard: teardown must run exactly once even when socket close and
    // process exit race each other.
    let mut cleaned_up = false;
    // Set once the event channel has delivered Exit and closed.
    let mut events_done = false;

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    axum::extract::ws::Message::Text(text) => {
                        dispatch_client_frame(&state, &session_id, &text, &mut cleaned_up).await;
                    }
                    axum::extract::ws::Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv(), if !events_done => {
                match event {
                    Some(SessionEvent::Output(data)) => {
                        if tx.send(output_frame(&session_id, &data)).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionEvent::Exit { code, signal }) => {
                        let _ = tx.send(exit_frame(&session_id, code, signal)).await;
                        // Process is gone: remove from the registry now. The
                        // close-path teardown below is then a no-op.
                        state.registry.unregister(&session_id).await;
                        cleaned_up = true;
                    }
                    None => events_done = true,
                }
            }
        }
    }

    if !cleaned_up {
        session.kill();
        state.registry.unregister(&session_id).await;
    }
    info!("Session {session_id} disconnected");
    send_task.abort();
}

/// Parse and apply one client frame. Malformed or unknown frames are logged
/// and ignored; the connection is never failed over a bad frame.
async fn dispatch_client_frame(
    state: &AppState,
    session_id: &str,
    text: &str,
    cleaned_up: &mut bool,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!("Session {session_id}: ignoring malformed frame");
        return;
    };

    match frame["type"].as_str().unwrap_or("") {
        "input" => {
            let data = frame["data"].as_str().unwrap_or("");
            if let Some(session) = state.registry.get(session_id).await {
                session.write(data.as_bytes()).await;
            }
        }
        "resize" => {
            let (cols, rows) = resize_dimensions(&frame);
            if let Some(session) = state.registry.get(session_id).await {
                if let Err(e) = session.resize(cols, rows) {
                    warn!("Session {session_id}: resize failed: {e}");
                }
            }
        }
        "kill" => {
            if let Some(session) = state.registry.get(session_id).await {
                session.kill();
                state.registry.unregister(session_id).await;
                *cleaned_up = true;
            }
        }
        other => {
            // Forward compatibility: newer clients may speak newer frames
            warn!("Session {session_id}: ignoring unknown frame type {other:?}");
        }
    }
}

/// Extract `cols`/`rows` from a resize frame, defaulting missing or invalid
/// fields to 80×24.
fn resize_dimensions(frame: &Value) -> (u16, u16) {
    #[allow(clippy::cast_possible_truncation)]
    let cols = frame["cols"].as_u64().filter(|&c| c > 0).unwrap_or(80) as u16;
    #[allow(clippy::cast_possible_truncation)]
    let rows = frame["rows"].as_u64().filter(|&r| r > 0).unwrap_or(24) as u16;
    (cols, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_defaults_missing_fields() {
        let frame = json!({"type": "resize"});
        assert_eq!(resize_dimensions(&frame), (80, 24));

        let frame = json!({"type": "resize", "cols": 132});
        assert_eq!(resize_dimensions(&frame), (132, 24));

        let frame = json!({"type": "resize", "cols": 0, "rows": 50});
        assert_eq!(resize_dimensions(&frame), (80, 50));
    }

    #[test]
    fn exit_frame_carries_signal_or_null() {
        let frame = exit_frame("s1", -1, Some(9));
        assert_eq!(frame["sessionId"], "s1");
        assert_eq!(frame["code"], -1);
        assert_eq!(frame["signal"], 9);

        let frame = exit_frame("s1", 0, None);
        assert!(frame["signal"].is_null());
    }

    #[test]
    fn connected_frame_names_the_session() {
        let frame = connected_frame("123-abcd", "/bin/sh", "/home/user");
        assert_eq!(frame["type"], "connected");
        assert_eq!(frame["sessionId"], "123-abcd");
        assert_eq!(frame["shell"], "/bin/sh");
        assert_eq!(frame["platform"], std::env::consts::OS);
    }
}
