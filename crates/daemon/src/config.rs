//! Configuration management for the PtyRelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyrelay/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Dimensions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the websocket listener binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7681";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("listen_addr must be a socket address like 127.0.0.1:7681, got {0}")]
    InvalidListenAddr(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("default size must be at least 1x1, got {cols}x{rows}")]
    InvalidDefaultSize { cols: u16, rows: u16 },

    #[error("resize_debounce_ms must be at most 10000, got {0}")]
    InvalidDebounce(u64),

    #[error("{name} must be greater than 0")]
    ZeroCapacity { name: &'static str },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the PtyRelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Websocket listener configuration.
    pub server: ServerConfig,

    /// Shell session configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
}

/// Websocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept websocket connections on.
    pub listen_addr: String,

    /// Seconds between websocket pings (0 disables the heartbeat).
    pub heartbeat_interval_secs: u64,

    /// Extra seconds to wait for any traffic after a ping before giving up.
    pub heartbeat_timeout_secs: u64,

    /// Capacity of the per-connection outbound message queue.
    pub outbound_capacity: usize,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell program spawned for each session.
    pub default_shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Working directory for new sessions. Inherited when unset.
    pub cwd: Option<PathBuf>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Columns used when the client sends an unusable initial size.
    pub default_cols: u16,

    /// Rows used when the client sends an unusable initial size.
    pub default_rows: u16,

    /// Quiet period before a burst of resize requests is applied.
    pub resize_debounce_ms: u64,

    /// Number of output chunks buffered between the pty reader and the client.
    pub output_capacity: usize,

    /// Seconds without input or output before a session is reaped (0 = never).
    pub idle_timeout_secs: u64,

    /// How often the reaper runs, in seconds.
    pub cleanup_interval_secs: u64,

    /// Environment variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            outbound_capacity: 256,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            shell_args: Vec::new(),
            cwd: None,
            max_sessions: 64,
            default_cols: protocol::DEFAULT_COLS,
            default_rows: protocol::DEFAULT_ROWS,
            resize_debounce_ms: 500,
            output_capacity: 64,
            idle_timeout_secs: 0,
            cleanup_interval_secs: 60,
            env: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parses the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.listen_addr.clone()))
    }

    /// Heartbeat ping interval, or `None` when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// Grace period after a ping before the peer is considered gone.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl SessionConfig {
    /// Size used when a client's initial size is unusable.
    pub fn default_dimensions(&self) -> Dimensions {
        Dimensions::new(i64::from(self.default_cols), i64::from(self.default_rows))
            .unwrap_or_default()
    }

    /// Resize coalescing window.
    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms)
    }

    /// Idle timeout, or `None` when idle sessions are kept forever.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Reaper interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyrelay")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYRELAY_LISTEN_ADDR: Override the listen address
    /// - PTYRELAY_SHELL: Override the shell program
    /// - PTYRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("PTYRELAY_LISTEN_ADDR") {
            tracing::info!("Overriding listen_addr from environment: {}", addr);
            self.server.listen_addr = addr;
        }

        if let Some(shell) = non_empty_env("PTYRELAY_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }

        if let Some(level) = non_empty_env("PTYRELAY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        self.server.socket_addr()?;

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidDefaultSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.resize_debounce_ms > 10_000 {
            return Err(ConfigError::InvalidDebounce(self.session.resize_debounce_ms));
        }

        if self.session.output_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "output_capacity",
            });
        }
        if self.server.outbound_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "outbound_capacity",
            });
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
