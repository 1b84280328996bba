//! Centralized error types for flowgate

use std::time::Duration;
use thiserror::Error;

/// Flow-control error types
#[derive(Debug, Error)]
pub enum FlowError {
    /// Invalid configuration, rejected at construction time
    #[error("configuration error: {0}")]
    Config(String),

    /// A request timed out waiting for an admission slot
    #[error("timed out waiting for a '{controller}' slot after {waited_ms}ms")]
    Timeout {
        /// Name of the controller that denied the request
        controller: String,
        /// The admission budget that was exhausted
        waited_ms: u64,
    },

    /// A request exceeded its rate allowance and the wait budget could not
    /// cover the next refill
    #[error("rate limit exceeded for {context}")]
    RateLimited {
        /// Human-readable description of the matched scope
        context: String,
        /// Time until a token becomes available, when known
        retry_after: Option<Duration>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// HTTP status code the outer layer should respond with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 503,
            Self::RateLimited { .. } => 429,
            Self::Config(_) | Self::Io(_) => 500,
        }
    }

    /// Whether this error is a per-request denial rather than a server fault
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RateLimited { .. })
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, FlowError>;
