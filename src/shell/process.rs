//! Low-level process spawning and output capture.
//!
//! Two entry points: [`spawn_shell_pipes`] for interactive sessions that
//! could not get a PTY (pipe fallback), and [`exec_command`] for one-shot
//! commands behind `POST /api/execute`. Both set `kill_on_drop(true)` so
//! orphaned processes are cleaned up if the owning task is cancelled.

use std::collections::HashMap;
use std::fmt::Write;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Spawn an interactive shell in its own process group with piped I/O.
///
/// Calls `setpgid(0, 0)` via `pre_exec` so the shell becomes a process group
/// leader; signals sent to `-pgid` then reach the entire process tree. This is
/// the fallback path when PTY allocation fails — no terminal semantics, no
/// resize, stdout and stderr arrive as separate streams.
pub fn spawn_shell_pipes(
    shell: &str,
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(shell);
    cmd.arg("-i")
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}

/// Execute a one-shot command via `<shell> -c "<command>"` and capture output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock), each
/// capped at `max_output` bytes, and returned as one combined string (stdout
/// first, then stderr). The entire operation is wrapped in a
/// `tokio::time::timeout`.
///
/// The shell runs as a process-group leader; on timeout the whole group is
/// SIGKILLed, so background children the command forked (`sleep 30 &`) die
/// with it instead of outliving the request.
///
/// When `env` is `Some`, the provided variables are merged into (not
/// replacing) the inherited environment.
pub async fn exec_command(
    shell: &str,
    working_dir: &str,
    command: &str,
    timeout_ms: u64,
    max_output: usize,
    env: Option<&HashMap<String, String>>,
) -> Result<ExecResult, ExecError> {
    let start = std::time::Instant::now();

    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(vars) = env {
        cmd.envs(vars);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;
    let pgid = child.id();

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let timeout = tokio::time::Duration::from_millis(timeout_ms);
    match Box::pin(tokio::time::timeout(timeout, async {
        // Both pipes drained in parallel; a full stderr buffer must never
        // stall a stdout writer or vice versa.
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, max_output),
            read_capped(&mut stderr, max_output),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        let mut output = stdout_data;
        if !stderr_data.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&stderr_data);
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            output,
            duration_ms,
        })
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => {
            // The dropped future takes the direct child with it
            // (kill_on_drop), but anything the command forked lives in the
            // same process group and must be killed explicitly.
            if let Some(pgid) = pgid {
                #[allow(clippy::cast_possible_wrap)]
                unsafe {
                    libc::kill(-(pgid as i32), libc::SIGKILL);
                }
            }
            Err(ExecError::Timeout)
        }
    }
}

/// Drain a stream to EOF, keeping at most `max_bytes` of it.
///
/// Everything past the cap is read and thrown away rather than left in the
/// pipe: abandoning the read side early would hit the still-writing child
/// with SIGPIPE, and a command that interleaves stdout and stderr could then
/// wedge on the other stream. A note is appended when output was dropped.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Successful result of [`exec_command`].
#[derive(Debug)]
pub struct ExecResult {
    /// Process exit code, or `-1` if the code was unavailable (e.g. killed by signal).
    pub exit_code: i32,
    /// Combined stdout + stderr (each capped, lossy UTF-8 conversion).
    pub output: String,
    /// Wall-clock duration of the command in milliseconds.
    pub duration_ms: u64,
}

/// Errors that can occur during [`exec_command`].
#[derive(Debug)]
pub enum ExecError {
    /// The shell binary could not be started (e.g. not found, permission denied).
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    Timeout,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Process error: {e}"),
            ExecError::Timeout => write!(f, "Command timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = exec_command("/bin/sh", "/", "printf hello; exit 3", 5000, MAX, None)
            .await
            .unwrap();
        assert_eq!(result.output, "hello");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn combines_stderr_after_stdout() {
        let result = exec_command("/bin/sh", "/", "echo out; echo err >&2", 5000, MAX, None)
            .await
            .unwrap();
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn times_out_within_budget() {
        let start = std::time::Instant::now();
        let err = exec_command("/bin/sh", "/", "sleep 5", 300, MAX, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn truncates_past_output_cap() {
        // 64 KB of output against an 8 KB cap
        let result = exec_command(
            "/bin/sh",
            "/",
            "head -c 65536 /dev/zero | tr '\\0' 'x'",
            5000,
            8192,
            None,
        )
        .await
        .unwrap();
        assert!(result.output.contains("[truncated: 65536 bytes total"));
    }

    #[tokio::test]
    async fn timeout_kills_background_children() {
        let pid_file = std::env::temp_dir().join(format!(
            "termbridge-exec-orphan-{}",
            std::process::id()
        ));
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let err = exec_command("/bin/sh", "/", &command, 300, MAX, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file written before timeout")
            .trim()
            .parse()
            .unwrap();
        let _ = std::fs::remove_file(&pid_file);

        // The whole process group was SIGKILLed; give the kernel a moment to
        // reparent and reap the background sleep.
        let mut alive = true;
        for _ in 0..20 {
            alive = unsafe { libc::kill(pid, 0) } == 0;
            if !alive {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(!alive, "background child (pid {pid}) survived the timeout");
    }

    #[tokio::test]
    async fn merges_env_overrides() {
        let mut env = HashMap::new();
        env.insert("BRIDGE_TEST_VAR".to_string(), "42".to_string());
        let result = exec_command(
            "/bin/sh",
            "/",
            "printf %s \"$BRIDGE_TEST_VAR\"",
            5000,
            MAX,
            Some(&env),
        )
        .await
        .unwrap();
        assert_eq!(result.output, "42");
    }
}
