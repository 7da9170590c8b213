//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PORT`, `HOST`, `SHELL`
//! 2. **Config file** — path via `--config <path>`, or `termbridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8765
//!
//! [shell]
//! default_shell = "/bin/sh"
//! default_working_dir = "~"
//!
//! [execute]
//! timeout_ms = 30000
//! max_output_bytes = 10485760  # 10 MB
//!
//! [supervisor]
//! health_interval_secs = 5
//! startup_grace_ms = 2000
//! probe_timeout_ms = 2000
//! failure_threshold = 3
//! restart_delay_secs = 1
//! max_restart_attempts = 5
//! cooldown_multiplier = 30
//! shutdown_timeout_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub execute: ExecuteConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bridge server bind settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default `127.0.0.1` — loopback only).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default 8765).
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shell defaults used when a connection or request doesn't override them.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary for sessions and one-shot execution (default `/bin/sh`,
    /// overridden by the `SHELL` environment variable).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory for new sessions (default `~`, the user's home).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
}

/// Limits for `POST /api/execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteConfig {
    /// Default timeout in milliseconds (default 30 000).
    #[serde(default = "default_execute_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum captured output per stream in bytes (default 10 MB).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Watchdog settings for `termbridge supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between health probes while the server is running (default 5).
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Milliseconds to wait after spawn before the first probe (default 2000).
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Per-probe HTTP timeout in milliseconds (default 2000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before a forced restart (default 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Base delay between restart attempts in seconds (default 1).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    /// Restart attempts within one window before entering cool-down (default 5).
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Cool-down factor applied to the base delay once attempts are exhausted
    /// (default 30 — i.e. 30 s with the default base delay).
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: u32,
    /// Seconds to wait for the child after SIGTERM before SIGKILL (default 5).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_execute_timeout_ms() -> u64 {
    30_000
}
fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_health_interval() -> u64 {
    5
}
fn default_startup_grace_ms() -> u64 {
    2000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_restart_delay() -> u64 {
    1
}
fn default_max_restart_attempts() -> u32 {
    5
}
fn default_cooldown_multiplier() -> u32 {
    30
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_working_dir: default_working_dir(),
        }
    }
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_execute_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            startup_grace_ms: default_startup_grace_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            restart_delay_secs: default_restart_delay(),
            max_restart_attempts: default_max_restart_attempts(),
            cooldown_multiplier: default_cooldown_multiplier(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            shell: ShellConfig::default(),
            execute: ExecuteConfig::default(),
            supervisor: SupervisorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — an explicitly
    /// requested config file that can't be read is a startup error). Otherwise
    /// looks for `termbridge.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("termbridge.toml").exists() {
            let content =
                std::fs::read_to_string("termbridge.toml").expect("Failed to read termbridge.toml");
            toml::from_str(&content).expect("Failed to parse termbridge.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                config.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.is_empty() {
                config.shell.default_shell = shell;
            }
        }

        config
    }
}
