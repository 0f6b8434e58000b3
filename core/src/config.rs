use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_ACTIVE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_KILL_GRACE_PERIOD_MS: u64 = 5_000;
/// Ten minutes between retention sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10 * 60 * 1_000;
/// Terminal records are kept for an hour after they end.
pub const DEFAULT_RETENTION_MS: u64 = 60 * 60 * 1_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;
pub const DEFAULT_OUTPUT_RETENTION_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_OUTPUT_DRAIN_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for a [`crate::ProcessManager`]. Every field has a default, so an
/// empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Interpreter used as `<shell> -c <command>`.
    pub shell: PathBuf,
    /// Working directory for requests that do not name one. Falls back to the
    /// process's current directory.
    pub default_cwd: Option<PathBuf>,
    /// Applied to active requests without an explicit `timeout_ms`. `0`
    /// disables the timer.
    pub default_active_timeout_ms: u64,
    pub kill_grace_period_ms: u64,
    pub sweep_interval_ms: u64,
    pub retention_ms: u64,
    pub event_capacity: usize,
    /// Per-stream cap on retained output. `None` or `0` keeps everything.
    pub output_retention_bytes: Option<usize>,
    /// How long to wait for the output pipes to close after the child exits.
    pub output_drain_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(default_shell()),
            default_cwd: None,
            default_active_timeout_ms: DEFAULT_ACTIVE_TIMEOUT_MS,
            kill_grace_period_ms: DEFAULT_KILL_GRACE_PERIOD_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            retention_ms: DEFAULT_RETENTION_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            output_retention_bytes: Some(DEFAULT_OUTPUT_RETENTION_BYTES),
            output_drain_timeout_ms: DEFAULT_OUTPUT_DRAIN_TIMEOUT_MS,
        }
    }
}

#[cfg(windows)]
fn default_shell() -> &'static str {
    "cmd.exe"
}

#[cfg(not(windows))]
fn default_shell() -> &'static str {
    "/bin/sh"
}

impl OrchestratorConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Timer for an active request; `None` means it never times out.
    pub fn active_timeout(&self, requested_ms: Option<u64>) -> Option<Duration> {
        match requested_ms.unwrap_or(self.default_active_timeout_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Where a request without its own `cwd` runs.
    pub fn resolve_cwd(&self, requested: Option<&Path>) -> PathBuf {
        requested
            .map(Path::to_path_buf)
            .or_else(|| self.default_cwd.clone())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn output_limit(&self) -> Option<usize> {
        self.output_retention_bytes.filter(|bytes| *bytes > 0)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_millis(self.kill_grace_period_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }
}
