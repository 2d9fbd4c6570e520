//! Error types for the worker pool

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the worker pool
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to spawn or talk to a worker process
    #[error("Worker spawn error: {0}")]
    Spawn(String),

    /// The worker for a class has exited
    #[error("Worker for class '{0}' is dead")]
    WorkerDead(String),

    /// A topic is already bound (single-binding invariant)
    #[error("Topic '{0}' already has a worker binding")]
    AlreadyBound(String),

    /// Encoding failed or the codec feature is not enabled
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Core error (bus, IPC, media)
    #[error(transparent)]
    Core(#[from] robolink_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
