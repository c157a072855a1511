//! MCP error types.

use std::time::Duration;

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn provider '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to provider '{name}': {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with provider '{name}' failed: {reason}")]
    Handshake { name: String, reason: String },

    #[error("tool discovery on provider '{name}' failed: {reason}")]
    Discovery { name: String, reason: String },

    #[error("tool call failed: {0}")]
    ToolCall(String),

    #[error("timeout after {timeout:?} waiting for '{method}'")]
    Timeout { method: String, timeout: Duration },

    #[error("provider not connected")]
    NotConnected,

    #[error("provider exited unexpectedly")]
    ServerExited,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if the error is a missed deadline rather than a failure reported by the peer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
