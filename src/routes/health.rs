//! Liveness endpoint, consumed by the supervisor.

use axum::Json;
use serde_json::{json, Value};

/// `GET /api/health` — liveness probe.
///
/// Answers in O(1) with no I/O that can block: the supervisor polls this on a
/// fixed interval and a slow response counts as a failed probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": crate::util::now_ms(),
        "pid": std::process::id(),
    }))
}
