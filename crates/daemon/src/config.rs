use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Tuning for the command supervisor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long a stopped command may take to exit after SIGTERM
    pub grace_period_ms: u64,
    /// How long to wait for exit after SIGKILL before giving up
    pub kill_wait_ms: u64,
    /// How long output readers may keep draining after the process exits
    pub output_drain_ms: u64,
    /// Number of finished commands kept for late queries
    pub max_retained: usize,
    /// Upper bound on the size of a single output chunk
    pub read_buffer_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            kill_wait_ms: 2_000,
            output_drain_ms: 1_000,
            max_retained: 64,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

/// Configuration for the daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    /// Single-instance lock; disabled when unset
    pub pid_file: Option<PathBuf>,
    /// Default working directory for commands that do not name one
    pub working_dir: Option<PathBuf>,
    /// Period of the health broadcast, 0 disables it
    pub health_interval_ms: u64,
    pub supervisor: SupervisorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            pid_file: None,
            working_dir: None,
            health_interval_ms: 60_000,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_ms > 0).then(|| Duration::from_millis(self.health_interval_ms))
    }

    /// Applies the `PORT` environment variable if it is set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_port_var(std::env::var("PORT").ok())
    }

    fn apply_port_var(&mut self, value: Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = value {
            self.port = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(raw.clone()))?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
}

/// Load daemon configuration from a JSON file, or defaults when no file is given.
///
/// An explicitly named file that cannot be read is an error.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let Some(path) = path else {
        tracing::info!("No configuration file given, using defaults");
        return Ok(DaemonConfig::default());
    };

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: DaemonConfig =
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    tracing::info!("Loaded configuration from {}", path.display());
    Ok(config)
}
