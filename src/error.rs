//! Error types for the session monitor

use std::io;

use thiserror::Error;

/// Result type alias for the session monitor
pub type Result<T> = std::result::Result<T, Error>;

/// Session monitor errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovery socket could not bind (fatal to startup only)
    #[error("Discovery bind failed: {0}")]
    Bind(String),

    /// Malformed discovery packet
    #[error("Malformed discovery packet: {0}")]
    Packet(String),

    /// No server with the given id is known
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// No session with the given id is known
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Backend refused the request (HTTP 403)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Backend returned 5xx or is otherwise not serving
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Request exceeded its deadline
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Backend response could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the condition is transient: the next snapshot or reconnect
    /// is expected to clear it without operator intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Unreachable(_)
                | Self::Timeout(_)
                | Self::InvalidResponse(_)
                | Self::Packet(_)
                | Self::Io(_)
                | Self::Json(_)
        )
    }
}
