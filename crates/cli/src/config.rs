//! Configuration loading from mcphub.toml.

use std::path::Path;
use std::time::Duration;

use mcp::ClientOptions;
use reactor::ReactorConfig;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Settings for outbound provider connections.
    #[serde(default)]
    pub client: ClientConfig,

    /// Settings for `mcphub serve`.
    #[serde(default)]
    pub reactor: ReactorSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: mcp::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            request_timeout_secs: mcp::DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReactorSettings {
    pub max_workers: usize,
    pub request_timeout_secs: u64,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            max_workers: reactor::DEFAULT_MAX_WORKERS,
            request_timeout_secs: reactor::DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reactor.max_workers == 0 {
            return Err(ConfigError::Invalid("reactor.max_workers must be at least 1".into()));
        }
        if self.client.connect_timeout_secs == 0 || self.client.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("client timeouts must be at least 1 second".into()));
        }
        if self.reactor.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "reactor.request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout_ms: millis(self.client.connect_timeout_secs),
            request_timeout_ms: millis(self.client.request_timeout_secs),
            ..ClientOptions::default()
        }
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            max_workers: self.reactor.max_workers,
            request_timeout_ms: millis(self.reactor.request_timeout_secs),
            ..ReactorConfig::default()
        }
    }
}

fn millis(secs: u64) -> u64 {
    Duration::from_secs(secs).as_millis() as u64
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
