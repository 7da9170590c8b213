//! Health-polling watchdog that keeps the bridge server alive.
//!
//! `termbridge supervise` spawns `termbridge serve` as a child process and
//! monitors it from the outside: a periodic `GET /api/health` probe plus the
//! child's own exit status. The two processes share nothing but HTTP and
//! signals.
//!
//! ## State machine
//!
//! ```text
//! Idle → Starting → Running ⇄ Unhealthy
//!           ▲                     │ (threshold)
//!           │                     ▼
//!           └──── Restarting ◄────┘◄── child exit (any state)
//!
//! ShuttingDown — reachable from any state on SIGINT/SIGTERM, terminal.
//! ```
//!
//! Transitions live in [`WatchdogState`] and the restart delay policy in
//! [`RestartPolicy`]; both are pure and tested without spawning anything.
//! The async loop in [`run_supervisor`] only drives them.
//!
//! ## Backoff
//!
//! Each consecutive restart increments a counter. Once the counter exceeds
//! `max_restart_attempts` the next delay is multiplied by the cool-down
//! factor and the counter resets — a crash loop backs off hard but the
//! supervisor never gives up permanently. A confirmed-healthy start (probe
//! success while `Starting`) resets the counter to zero.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::{Config, SupervisorConfig};

/// Watchdog lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Unhealthy,
    Restarting,
    ShuttingDown,
}

/// Restart delay policy: fixed base delay with a cool-down once a window of
/// attempts is exhausted.
#[derive(Debug)]
pub struct RestartPolicy {
    base_delay: Duration,
    max_attempts: u32,
    cooldown_multiplier: u32,
    restart_count: u32,
}

impl RestartPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32, cooldown_multiplier: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            cooldown_multiplier,
            restart_count: 0,
        }
    }

    /// Record one restart and return the delay to wait before it.
    ///
    /// Exceeding `max_attempts` yields one cool-down delay and resets the
    /// window, so a persistent crash loop retries indefinitely at the
    /// cool-down cadence instead of spinning at the base delay.
    pub fn next_delay(&mut self) -> Duration {
        self.restart_count += 1;
        if self.restart_count > self.max_attempts {
            self.restart_count = 0;
            self.base_delay * self.cooldown_multiplier
        } else {
            self.base_delay
        }
    }

    /// Reset the window after a confirmed-healthy start.
    pub fn reset(&mut self) {
        self.restart_count = 0;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }
}

/// Pure transition logic for the watchdog, driven by [`run_supervisor`].
#[derive(Debug)]
pub struct WatchdogState {
    phase: Phase,
    consecutive_health_failures: u32,
    failure_threshold: u32,
    policy: RestartPolicy,
}

impl WatchdogState {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            phase: Phase::Idle,
            consecutive_health_failures: 0,
            failure_threshold: config.failure_threshold,
            policy: RestartPolicy::new(
                Duration::from_secs(config.restart_delay_secs),
                config.max_restart_attempts,
                config.cooldown_multiplier,
            ),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn consecutive_health_failures(&self) -> u32 {
        self.consecutive_health_failures
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase == Phase::ShuttingDown
    }

    /// A child process was spawned.
    pub fn on_spawn(&mut self) {
        if !self.is_shutting_down() {
            self.phase = Phase::Starting;
        }
    }

    /// A health probe succeeded. Returns `true` when this confirms a fresh
    /// start (`Starting → Running`), which also resets the restart window.
    pub fn on_probe_success(&mut self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let confirmed_start = self.phase == Phase::Starting;
        if confirmed_start {
            self.policy.reset();
        }
        self.consecutive_health_failures = 0;
        self.phase = Phase::Running;
        confirmed_start
    }

    /// A health probe failed. Returns `true` once the consecutive-failure
    /// threshold is crossed and a forced restart must happen.
    pub fn on_probe_failure(&mut self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.consecutive_health_failures += 1;
        if self.consecutive_health_failures >= self.failure_threshold {
            self.consecutive_health_failures = 0;
            self.phase = Phase::Restarting;
            true
        } else {
            self.phase = Phase::Unhealthy;
            false
        }
    }

    /// The child exited on its own — treated identically to a failed health
    /// check that crossed the threshold.
    pub fn on_child_exit(&mut self) {
        if !self.is_shutting_down() {
            self.consecutive_health_failures = 0;
            self.phase = Phase::Restarting;
        }
    }

    /// SIGINT/SIGTERM received. Latched: no later event leaves this phase.
    pub fn on_shutdown(&mut self) {
        self.phase = Phase::ShuttingDown;
    }

    /// Delay before the next restart attempt.
    pub fn next_restart_delay(&mut self) -> Duration {
        self.policy.next_delay()
    }

    #[cfg(test)]
    fn restart_count(&self) -> u32 {
        self.policy.restart_count()
    }
}

/// Why [`monitor_child`] returned.
enum MonitorOutcome {
    /// Child is dead (exited or was terminated); schedule a restart.
    Restart,
    /// SIGINT/SIGTERM — stop supervising.
    Shutdown,
}

/// Run the supervisor loop. Never returns: exits the process with 0 on
/// graceful shutdown or 1 on unrecoverable startup failure.
pub async fn run_supervisor(config_path: Option<&str>, config: &Config) -> ! {
    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            error!("Supervisor: cannot resolve own executable path: {e}");
            std::process::exit(1);
        }
    };

    let sup = &config.supervisor;
    let probe_url = probe_url(&config.server.host, config.server.port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(sup.probe_timeout_ms))
        .build()
        .expect("Failed to build HTTP client");

    let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
    let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");

    let mut state = WatchdogState::new(sup);
    let mut first_start = true;

    info!("Supervisor: watching {} (probe {probe_url})", exe.display());

    loop {
        state.on_spawn();
        let mut child = match spawn_server(&exe, config_path) {
            Ok(child) => child,
            Err(e) if first_start => {
                error!("Supervisor: failed to start server: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                error!("Supervisor: respawn failed: {e}");
                state.on_child_exit();
                if wait_restart_delay(&mut state, &mut sigint, &mut sigterm).await {
                    continue;
                }
                std::process::exit(0);
            }
        };
        first_start = false;
        forward_child_output(&mut child);
        info!("Supervisor: started server (pid {:?})", child.id());

        let outcome = monitor_child(
            &mut child,
            &mut state,
            &client,
            &probe_url,
            sup,
            &mut sigint,
            &mut sigterm,
        )
        .await;

        match outcome {
            MonitorOutcome::Shutdown => {
                info!("Supervisor: shutting down, terminating server");
                terminate_child(&mut child, Duration::from_secs(sup.shutdown_timeout_secs)).await;
                info!("Supervisor: goodbye");
                std::process::exit(0);
            }
            MonitorOutcome::Restart => {
                if !wait_restart_delay(&mut state, &mut sigint, &mut sigterm).await {
                    // Shutdown arrived during the backoff wait; the child is
                    // already dead, nothing left to terminate.
                    info!("Supervisor: goodbye");
                    std::process::exit(0);
                }
            }
        }
    }
}

/// Sleep out the restart backoff, racing shutdown signals. Returns `false`
/// when shutdown was requested (the pending restart is cancelled).
async fn wait_restart_delay(
    state: &mut WatchdogState,
    sigint: &mut Signal,
    sigterm: &mut Signal,
) -> bool {
    let delay = state.next_restart_delay();
    warn!("Supervisor: restarting server in {delay:?}");
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        _ = sigint.recv() => {
            state.on_shutdown();
            false
        }
        _ = sigterm.recv() => {
            state.on_shutdown();
            false
        }
    }
}

/// Watch one child until it needs restarting or shutdown is requested.
///
/// On return via `Restart` the child is guaranteed dead: either it exited on
/// its own, or it failed enough probes and was terminated here.
#[allow(clippy::too_many_arguments)]
async fn monitor_child(
    child: &mut Child,
    state: &mut WatchdogState,
    client: &reqwest::Client,
    probe_url: &str,
    config: &SupervisorConfig,
    sigint: &mut Signal,
    sigterm: &mut Signal,
) -> MonitorOutcome {
    // Startup grace: give the server a moment to bind before the first probe.
    tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(config.startup_grace_ms)) => {}
        status = child.wait() => {
            warn!("Supervisor: server exited during startup ({status:?})");
            state.on_child_exit();
            return MonitorOutcome::Restart;
        }
        _ = sigint.recv() => {
            state.on_shutdown();
            return MonitorOutcome::Shutdown;
        }
        _ = sigterm.recv() => {
            state.on_shutdown();
            return MonitorOutcome::Shutdown;
        }
    }

    // First tick fires immediately — probe right after the grace window.
    let mut interval = tokio::time::interval(Duration::from_secs(config.health_interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if probe_health(client, probe_url).await {
                    if state.on_probe_success() {
                        info!("Supervisor: server confirmed healthy");
                    }
                } else {
                    let restart = state.on_probe_failure();
                    warn!(
                        "Supervisor: health probe failed ({} consecutive)",
                        if restart { config.failure_threshold } else { state.consecutive_health_failures() }
                    );
                    if restart {
                        warn!("Supervisor: failure threshold reached, restarting server");
                        terminate_child(child, Duration::from_secs(config.shutdown_timeout_secs))
                            .await;
                        return MonitorOutcome::Restart;
                    }
                }
            }
            status = child.wait() => {
                warn!("Supervisor: server exited ({status:?})");
                state.on_child_exit();
                return MonitorOutcome::Restart;
            }
            _ = sigint.recv() => {
                info!("Supervisor: received SIGINT");
                state.on_shutdown();
                return MonitorOutcome::Shutdown;
            }
            _ = sigterm.recv() => {
                info!("Supervisor: received SIGTERM");
                state.on_shutdown();
                return MonitorOutcome::Shutdown;
            }
        }
    }
}

/// `GET /api/health`, bounded by the client's per-request timeout. Any
/// transport error, non-2xx status, or unexpected body counts as a failure.
async fn probe_health(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            matches!(resp.json::<serde_json::Value>().await, Ok(body) if body["status"] == "ok")
        }
        _ => false,
    }
}

/// The probe target. Wildcard bind addresses (v4 or v6) are probed via
/// loopback; IPv6 literals get bracketed.
fn probe_url(host: &str, port: u16) -> String {
    let host = match host {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    };
    if host.contains(':') {
        format!("http://[{host}]:{port}/api/health")
    } else {
        format!("http://{host}:{port}/api/health")
    }
}

/// Spawn `<self> serve [--config <path>]` with piped stdout/stderr.
fn spawn_server(exe: &std::path::Path, config_path: Option<&str>) -> std::io::Result<Child> {
    let mut cmd = Command::new(exe);
    cmd.arg("serve")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(p) = config_path {
        cmd.args(["--config", p]);
    }
    cmd.spawn()
}

/// Forward the child's stdout/stderr lines into our own logging sink with a
/// distinguishing prefix. Observability only — not part of the control flow.
fn forward_child_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("server: {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("server: {line}");
            }
        });
    }
}

/// Graceful-then-forceful termination: SIGTERM, wait up to `grace`, SIGKILL.
async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    #[allow(clippy::cast_possible_wrap)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Supervisor: server did not exit after SIGTERM, sending SIGKILL");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            health_interval_secs: 5,
            startup_grace_ms: 2000,
            probe_timeout_ms: 2000,
            failure_threshold: 3,
            restart_delay_secs: 1,
            max_restart_attempts: 5,
            cooldown_multiplier: 30,
            shutdown_timeout_secs: 5,
        }
    }

    #[test]
    fn probe_success_confirms_start_and_resets_window() {
        let mut state = WatchdogState::new(&test_config());
        state.on_spawn();
        assert_eq!(state.phase(), Phase::Starting);

        // Burn a couple of restarts first
        let _ = state.next_restart_delay();
        let _ = state.next_restart_delay();
        assert_eq!(state.restart_count(), 2);

        assert!(state.on_probe_success());
        assert_eq!(state.phase(), Phase::Running);
        assert_eq!(state.restart_count(), 0);

        // A later probe success while already Running is not a fresh start
        assert!(!state.on_probe_success());
    }

    #[test]
    fn failures_below_threshold_mark_unhealthy_without_restart() {
        let mut state = WatchdogState::new(&test_config());
        state.on_spawn();
        state.on_probe_success();

        assert!(!state.on_probe_failure());
        assert_eq!(state.phase(), Phase::Unhealthy);
        assert_eq!(state.consecutive_health_failures(), 1);

        assert!(!state.on_probe_failure());
        assert_eq!(state.consecutive_health_failures(), 2);

        // A success in between clears the consecutive counter
        state.on_probe_success();
        assert_eq!(state.consecutive_health_failures(), 0);
        assert_eq!(state.phase(), Phase::Running);
    }

    #[test]
    fn threshold_crossing_triggers_restart() {
        let mut state = WatchdogState::new(&test_config());
        state.on_spawn();
        state.on_probe_success();

        assert!(!state.on_probe_failure());
        assert!(!state.on_probe_failure());
        assert!(state.on_probe_failure());
        assert_eq!(state.phase(), Phase::Restarting);
    }

    #[test]
    fn child_exit_forces_restart_from_any_phase() {
        let mut state = WatchdogState::new(&test_config());
        state.on_spawn();
        state.on_child_exit();
        assert_eq!(state.phase(), Phase::Restarting);

        state.on_spawn();
        state.on_probe_success();
        state.on_child_exit();
        assert_eq!(state.phase(), Phase::Restarting);
    }

    #[test]
    fn backoff_enters_cooldown_after_max_attempts() {
        let base = Duration::from_secs(1);
        let mut policy = RestartPolicy::new(base, 3, 30);

        assert_eq!(policy.next_delay(), base);
        assert_eq!(policy.next_delay(), base);
        assert_eq!(policy.next_delay(), base);
        // Attempt window exhausted: one cool-down delay, counter resets
        assert_eq!(policy.next_delay(), base * 30);
        assert_eq!(policy.restart_count(), 0);
        // ...and the cycle starts over rather than giving up
        assert_eq!(policy.next_delay(), base);
    }

    #[test]
    fn shutdown_is_latched() {
        let mut state = WatchdogState::new(&test_config());
        state.on_spawn();
        state.on_probe_success();
        state.on_shutdown();
        assert!(state.is_shutting_down());

        // No event may leave ShuttingDown
        state.on_spawn();
        assert!(state.is_shutting_down());
        state.on_probe_success();
        assert!(state.is_shutting_down());
        assert!(!state.on_probe_failure());
        assert!(state.is_shutting_down());
        state.on_child_exit();
        assert!(state.is_shutting_down());
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            health_interval_secs: 1,
            startup_grace_ms: 50,
            probe_timeout_ms: 500,
            failure_threshold: 3,
            restart_delay_secs: 0,
            max_restart_attempts: 5,
            cooldown_multiplier: 30,
            shutdown_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn dead_child_restarts_and_respawn_is_confirmed_healthy() {
        // Stand-in for the bridge server's health endpoint.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/api/health",
            axum::routing::get(crate::routes::health::health),
        );
        let responder = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let probe_target = format!("http://{addr}/api/health");

        let config = fast_config();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_timeout_ms))
            .build()
            .unwrap();
        let mut state = WatchdogState::new(&config);
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        let mut sigterm = signal(SignalKind::terminate()).unwrap();

        // A child that dies straight away must come back as a restart request.
        state.on_spawn();
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let outcome = monitor_child(
            &mut child,
            &mut state,
            &client,
            &probe_target,
            &config,
            &mut sigint,
            &mut sigterm,
        )
        .await;
        assert!(matches!(outcome, MonitorOutcome::Restart));
        assert_eq!(state.phase(), Phase::Restarting);

        // The respawn stays up and the probe confirms it healthy, so the
        // monitor has no reason to return within the window.
        state.on_spawn();
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let monitored = monitor_child(
            &mut child,
            &mut state,
            &client,
            &probe_target,
            &config,
            &mut sigint,
            &mut sigterm,
        );
        let finished = tokio::time::timeout(Duration::from_secs(2), monitored).await;
        assert!(finished.is_err(), "monitor must keep watching a healthy child");
        assert_eq!(state.phase(), Phase::Running);

        let _ = child.kill().await;
        responder.abort();
    }

    #[test]
    fn wildcard_bind_is_probed_via_loopback() {
        assert_eq!(
            probe_url("0.0.0.0", 8765),
            "http://127.0.0.1:8765/api/health"
        );
        assert_eq!(probe_url("::", 8765), "http://[::1]:8765/api/health");
        assert_eq!(
            probe_url("127.0.0.1", 9000),
            "http://127.0.0.1:9000/api/health"
        );
    }
}
