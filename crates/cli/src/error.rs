//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// `mcphub.toml` could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `--args` was not a JSON object.
    #[error("invalid tool arguments: {0}")]
    InvalidArgs(String),

    /// Every configured provider failed or was skipped.
    #[error("no providers could be loaded")]
    NoProviders,

    /// An error occurred talking to a provider.
    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    /// The reactor's read loop failed.
    #[error(transparent)]
    Reactor(#[from] reactor::Error),

    /// Output could not be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
