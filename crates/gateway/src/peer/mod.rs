//! Per-peer session state

pub mod transport;
pub mod webrtc;

#[cfg(test)]
pub mod mock;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;
use transport::{DataChannelSink, MediaSink, PeerTransport};

/// Negotiation state machine, owned exclusively by one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Processing,
    AwaitingStableSignaling,
    OfferCreated,
    AwaitingIce,
    WaitingAnswer,
    Stable,
    Failed,
}

/// Direction of a data channel relative to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Bus to peer
    Outbound,
    /// Peer to bus
    Inbound,
}

/// Gateway-side record of one transport data channel
#[derive(Clone)]
pub struct ChannelHandle {
    pub id: u16,
    pub topic: String,
    pub msg_type: String,
    pub direction: ChannelDirection,
    pub reliable: bool,
    pub sink: Arc<dyn DataChannelSink>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("msg_type", &self.msg_type)
            .field("direction", &self.direction)
            .field("reliable", &self.reliable)
            .finish()
    }
}

/// One remote peer's session state
///
/// Created on the first `peer` signaling event, destroyed on disconnect or
/// terminal negotiation failure. All channel and subscription resources must
/// be released before the peer is dropped from the registry.
pub struct Peer {
    /// Peer identity from the signaling relay
    pub id: String,
    /// Gateway-assigned session id
    pub session_id: String,
    /// Transport this peer negotiates over
    pub transport: Arc<dyn PeerTransport>,

    /// Topics the peer wants to read
    pub read_subs: RwLock<HashSet<String>>,
    /// Topics the peer wants to write, with their declared types
    pub write_subs: RwLock<HashMap<String, String>>,
    /// Topics requested but not yet known to discovery
    pub pending_topics: RwLock<HashSet<String>>,

    /// Open bus-to-peer data channels by topic
    pub outbound_channels: RwLock<HashMap<String, ChannelHandle>>,
    /// Open peer-to-bus data channels by topic
    pub inbound_channels: RwLock<HashMap<String, ChannelHandle>>,
    /// Video senders by topic
    pub media_senders: RwLock<HashMap<String, Arc<dyn MediaSink>>>,

    state: RwLock<NegotiationState>,
    /// Single-flight reconciliation guard
    processing: AtomicBool,
    /// When the guard was last taken, for stuck-guard reclamation
    processing_since: parking_lot::Mutex<Option<Instant>>,
    /// Next transport channel id, monotonically assigned
    next_channel_id: AtomicU16,
}

impl Peer {
    pub fn new(id: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id: id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            transport,
            read_subs: RwLock::new(HashSet::new()),
            write_subs: RwLock::new(HashMap::new()),
            pending_topics: RwLock::new(HashSet::new()),
            outbound_channels: RwLock::new(HashMap::new()),
            inbound_channels: RwLock::new(HashMap::new()),
            media_senders: RwLock::new(HashMap::new()),
            state: RwLock::new(NegotiationState::Idle),
            processing: AtomicBool::new(false),
            processing_since: parking_lot::Mutex::new(None),
            next_channel_id: AtomicU16::new(0),
        }
    }

    pub async fn state(&self) -> NegotiationState {
        *self.state.read().await
    }

    pub async fn set_state(&self, new_state: NegotiationState) {
        let mut state = self.state.write().await;
        if *state != new_state {
            debug!("Peer {} negotiation: {:?} -> {:?}", self.id, *state, new_state);
            *state = new_state;
        }
    }

    /// Try to take the single-flight guard. Returns false when another
    /// reconciliation holds it.
    pub fn try_acquire(&self) -> bool {
        let taken = self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if taken {
            *self.processing_since.lock() = Some(Instant::now());
        }
        taken
    }

    /// Release the single-flight guard.
    pub fn release(&self) {
        self.processing.store(false, Ordering::SeqCst);
        *self.processing_since.lock() = None;
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// How long the current holder has had the guard.
    pub fn processing_elapsed(&self) -> Option<std::time::Duration> {
        self.processing_since.lock().map(|t| t.elapsed())
    }

    /// Allocate the next transport channel id for this peer.
    pub fn next_channel_id(&self) -> u16 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether any channel or sender is currently open.
    pub async fn has_open_channels(&self) -> bool {
        !self.outbound_channels.read().await.is_empty()
            || !self.inbound_channels.read().await.is_empty()
            || !self.media_senders.read().await.is_empty()
    }
}
