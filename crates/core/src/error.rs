//! Error types for robolink core

use thiserror::Error;

/// Result type alias for robolink core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in robolink core
#[derive(Debug, Error)]
pub enum Error {
    /// Bus subscription or publish error
    #[error("Bus error: {0}")]
    Bus(String),

    /// Service call failed on the bus
    #[error("Service call failed for '{service}': {reason}")]
    ServiceCall {
        /// Service name
        service: String,
        /// Failure reason
        reason: String,
    },

    /// IPC framing or transport error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// An IPC frame exceeded the maximum allowed size
    #[error("IPC frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Observed frame size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Malformed or unsupported media payload
    #[error("Unsupported media payload: {0}")]
    UnsupportedMedia(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary (bincode) serialization error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
