//! HTTP route handlers.
//!
//! Each sub-module corresponds to one endpoint. The WebSocket upgrade lives
//! in [`crate::ws`], not here — it is a long-lived protocol, not a
//! request/response handler.

pub mod execute;
pub mod health;
pub mod info;
