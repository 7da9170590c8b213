//! Shell process management.
//!
//! Two modes of shell interaction:
//!
//! - **One-shot** ([`process::exec_command`]) — run a command, capture output,
//!   return. Used by `POST /api/execute`.
//! - **Interactive** — a long-lived shell bound to a
//!   [`crate::session::TerminalSession`], PTY-backed when the OS cooperates
//!   ([`pty::spawn_shell_pty`]) and pipe-backed otherwise
//!   ([`process::spawn_shell_pipes`]).

pub mod process;
pub mod pty;
