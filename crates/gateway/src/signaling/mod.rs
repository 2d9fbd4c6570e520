//! Signaling relay connection

pub mod client;
pub mod protocol;

pub use client::SignalingClient;
pub use protocol::{Envelope, Outgoing, SignalEvent};
