//! Transport seam between the negotiation engine and the WebRTC stack
//!
//! The engine and router only ever see these traits. The production
//! implementation is [`super::webrtc::WebRtcPeer`]; tests drive the state
//! machine with a scripted mock.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Signaling state of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        }
    }
}

/// ICE candidate gathering progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Overall peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One media sample handed to a peer's video sender
#[derive(Debug, Clone)]
pub struct MediaSample {
    /// Annex-B access unit
    pub data: Bytes,
    /// Time covered by this sample (drives the RTP clock)
    pub duration: Duration,
}

/// Outbound or inbound data channel endpoint
#[async_trait]
pub trait DataChannelSink: Send + Sync {
    /// Transport-level channel id (negotiated, assigned by the gateway)
    fn id(&self) -> u16;

    /// Whether the channel has reached the open state
    fn is_open(&self) -> bool;

    /// Send one message; fails when the channel is not open
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Register the inbound message handler (peer-to-bus channels)
    fn on_message(&self, handler: Box<dyn Fn(Vec<u8>) + Send + Sync>);

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// Video sender endpoint for one topic
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Whether the owning peer connection is in a connected state
    fn is_connected(&self) -> bool;

    /// Deliver one sample; may block on the transport's pacing
    async fn write_sample(&self, sample: MediaSample) -> Result<()>;
}

/// Peer connection surface the negotiation engine drives
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn gathering_state(&self) -> GatheringState;

    fn connection_state(&self) -> ConnectionState;

    /// Create an SDP offer without touching the local description
    async fn create_offer(&self) -> Result<String>;

    /// Set the local description to the given offer SDP
    async fn set_local_description(&self, sdp: String) -> Result<()>;

    /// Current local description, with any gathered candidates embedded
    async fn local_description(&self) -> Option<String>;

    /// Apply the remote answer SDP
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Create a negotiated data channel with an explicit id
    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
        reliable: bool,
    ) -> Result<Arc<dyn DataChannelSink>>;

    /// Add an outbound H.264 video track for a topic
    async fn add_video_sender(&self, topic: &str) -> Result<Arc<dyn MediaSink>>;

    /// Remove the video track for a topic
    async fn remove_video_sender(&self, topic: &str) -> Result<()>;

    /// Close the connection and all its channels
    async fn close(&self) -> Result<()>;
}
