//! Error types for the session protocol engine.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type SonicResult<T> = Result<T, SonicError>;

/// Errors that can occur while driving a bidirectional speech session.
#[derive(Error, Debug)]
pub enum SonicError {
    /// Connection establishment failed (missing credentials, unreachable
    /// endpoint). Fatal: callers must not retry automatically.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The caller or the peer violated the content-block lifecycle.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Event could not be encoded or decoded.
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A downstream channel was closed while the session was still active.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}
