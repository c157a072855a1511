//! Reactor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of concurrently running blocking handlers.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default per-call deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Upper bound on blocking handlers running at once.
    pub max_workers: usize,
    /// Deadline for a single handler execution.
    pub request_timeout_ms: u64,
    /// Input lines longer than this are rejected.
    pub max_line_bytes: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_line_bytes: mcp::MAX_LINE_BYTES,
        }
    }
}

impl ReactorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
