//! Error types for the gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Another reconciliation for the peer is still in flight
    #[error("Peer '{0}' is busy negotiating")]
    Busy(String),

    /// Signaling state never reached stable within the wait budget
    #[error("Negotiation timed out for peer '{0}'")]
    NegotiationTimeout(String),

    /// ICE gathering never completed within the wait budget
    #[error("ICE gathering timed out for peer '{0}'")]
    IceTimeout(String),

    /// An answer arrived outside the have-local-offer window
    #[error("Stale answer for peer '{peer}' (signaling state: {state})")]
    StaleAnswer { peer: String, state: String },

    /// Setting a local or remote description failed
    #[error("Set description failed: {0}")]
    SetDescription(String),

    /// Transport-level failure (peer connection, track, channel creation)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Sending on a data channel failed or the channel is closed
    #[error("Channel error on '{topic}': {reason}")]
    Channel { topic: String, reason: String },

    /// No peer registered under the given id
    #[error("Unknown peer '{0}'")]
    PeerNotFound(String),

    /// Malformed or unsupported signaling payload
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// WebSocket failure on the signaling connection
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP download failure for the file operation
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration file problem
    #[error("Config error: {0}")]
    Config(String),

    /// Core error (bus, IPC, media)
    #[error(transparent)]
    Core(#[from] robolink_core::Error),

    /// Worker pool error
    #[error(transparent)]
    Worker(#[from] robolink_workers::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
