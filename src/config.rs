use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_duration_secs")]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_secs: default_interval_secs(),
            session: SessionConfig::default(),
            reports: ReportsConfig::default(),
            sources: SourcesConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_session_duration_secs(),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            top_processes: default_top_processes(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Longest accepted monitoring session (24h).
pub const MAX_SESSION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.session.duration_secs > MAX_SESSION_SECS {
            return Err(ConfigError::Validation(format!(
                "session.duration_secs must be <= {MAX_SESSION_SECS}"
            )));
        }
        if self.session.duration_secs < self.interval_secs {
            return Err(ConfigError::Validation(
                "session.duration_secs must be >= interval_secs".to_string(),
            ));
        }
        if self.reports.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "reports.output_dir must not be empty".to_string(),
            ));
        }
        if self.sources.top_processes < 1 {
            return Err(ConfigError::Validation(
                "sources.top_processes must be >= 1".to_string(),
            ));
        }
        if self.sources.command_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sources.command_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.sources.command_timeout_ms >= self.interval_secs.saturating_mul(1000) {
            return Err(ConfigError::Validation(
                "sources.command_timeout_ms must be shorter than the tick interval".to_string(),
            ));
        }
        if self.live.channel_capacity < 1 {
            return Err(ConfigError::Validation(
                "live.channel_capacity must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session.duration_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.sources.command_timeout_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

const fn default_interval_secs() -> u64 {
    1
}

const fn default_session_duration_secs() -> u64 {
    300
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./reports")
}

const fn default_top_processes() -> usize {
    5
}

const fn default_command_timeout_ms() -> u64 {
    750
}

const fn default_channel_capacity() -> usize {
    16
}
