//! Reactor error types.

use mcp::JsonRpcError;
use thiserror::Error;

/// Errors that stop the reactor's read loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Reading input or writing output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `serve` was called on a reactor that has already served.
    #[error("reactor has already served")]
    AlreadyServed,

    /// The writer task ended abnormally.
    #[error("writer task failed: {0}")]
    Writer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a registered method.
///
/// Converted to a JSON-RPC error at the dispatch boundary and never
/// propagated further.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler reported a failure; becomes an internal error.
    #[error("{0}")]
    Failed(String),

    /// The handler chose the exact error to send back.
    #[error("{0}")]
    Rpc(JsonRpcError),

    /// The handler panicked.
    #[error("{0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// The error object sent to the caller.
    pub fn into_rpc(self) -> JsonRpcError {
        match self {
            HandlerError::Failed(message) | HandlerError::Panicked(message) => {
                JsonRpcError::internal_error(message)
            }
            HandlerError::Rpc(error) => error,
        }
    }
}

impl From<JsonRpcError> for HandlerError {
    fn from(error: JsonRpcError) -> Self {
        Self::Rpc(error)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Failed(error.to_string())
    }
}
