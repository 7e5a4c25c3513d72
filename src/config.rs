//! Global configuration parsing and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Configurable timing values (seconds) for channels, workers, and sessions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Client-side keepalive ping cadence. Must be strictly shorter than
    /// `idle_interval_seconds` so the connection is refreshed from both sides.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    /// Server-side idle keepalive cadence.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_seconds: u64,
    /// Missed idle intervals before the server closes a silent channel.
    #[serde(default = "default_missed_intervals")]
    pub missed_intervals: u32,
    /// Fixed delay between client reconnect attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: u64,
    /// Maximum reconnect attempts before surfacing a connectivity error.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Grace window between SIGTERM and forced kill of a superseded worker.
    #[serde(default = "default_grace_kill")]
    pub grace_kill_seconds: u64,
    /// How long a `CREATED` session may wait for its first channel.
    #[serde(default = "default_staging")]
    pub staging_seconds: u64,
}

fn default_ping_interval() -> u64 {
    15
}

fn default_idle_interval() -> u64 {
    45
}

fn default_missed_intervals() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    3
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_grace_kill() -> u64 {
    5
}

fn default_staging() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ping_interval_seconds: default_ping_interval(),
            idle_interval_seconds: default_idle_interval(),
            missed_intervals: default_missed_intervals(),
            reconnect_delay_seconds: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            grace_kill_seconds: default_grace_kill(),
            staging_seconds: default_staging(),
        }
    }
}

impl TimeoutConfig {
    /// Server-side deadline after which a silent channel is closed.
    #[must_use]
    pub fn idle_deadline(&self) -> Duration {
        Duration::from_secs(self.idle_interval_seconds * u64::from(self.missed_intervals))
    }

    /// Client keepalive ping cadence.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    /// Fixed delay between reconnect attempts.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    /// Grace window before a superseded worker is force-killed.
    #[must_use]
    pub fn grace_kill(&self) -> Duration {
        Duration::from_secs(self.grace_kill_seconds)
    }
}

/// External generator command run by the worker's script pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GeneratorConfig {
    /// Generator binary invoked per pipeline run (e.g. `paperflow-generate`).
    #[serde(default = "default_generator_command")]
    pub command: String,
    /// Default arguments prepended before operation-specific parameters.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: default_generator_command(),
            args: Vec::new(),
        }
    }
}

fn default_generator_command() -> String {
    "paperflow-generate".into()
}

fn default_http_port() -> u16 {
    8787
}

fn default_retention_minutes() -> u32 {
    60
}

fn default_worker_bin() -> String {
    "paperflow-worker".into()
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("paperflow-locks")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// HTTP/WebSocket listen port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Worker binary registered as the `paperflow://` scheme handler.
    #[serde(default = "default_worker_bin")]
    pub worker_bin: String,
    /// Directory holding worker lock records.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Minutes after a terminal state before a session is evicted.
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u32,
    /// Timing configuration for channels, workers, and sessions.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// External generator invoked by the worker.
    #[serde(default)]
    pub generator: GeneratorConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            worker_bin: default_worker_bin(),
            lock_dir: default_lock_dir(),
            retention_minutes: default_retention_minutes(),
            timeouts: TimeoutConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Retention window past terminal state before eviction.
    #[must_use]
    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_minutes) * 60)
    }

    /// Staging window a `CREATED` session may spend without a channel.
    #[must_use]
    pub fn staging_window(&self) -> Duration {
        Duration::from_secs(self.timeouts.staging_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.timeouts.ping_interval_seconds >= self.timeouts.idle_interval_seconds {
            return Err(AppError::Config(
                "ping_interval_seconds must be strictly shorter than idle_interval_seconds".into(),
            ));
        }

        if self.timeouts.missed_intervals == 0 {
            return Err(AppError::Config(
                "missed_intervals must be greater than zero".into(),
            ));
        }

        if self.timeouts.max_reconnect_attempts == 0 {
            return Err(AppError::Config(
                "max_reconnect_attempts must be greater than zero".into(),
            ));
        }

        if self.worker_bin.trim().is_empty() {
            return Err(AppError::Config("worker_bin must not be empty".into()));
        }

        Ok(())
    }
}
