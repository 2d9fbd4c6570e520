//! Topic subscription router
//!
//! Three delivery flavors, one shared contract: at most one upstream worker
//! subscription per topic process-wide, refcounted by sinks (first sink
//! opens, last sink closes), idempotent `start`, no-op `stop` on unknown
//! sinks. The flavor for a topic is decided by its message type, so a topic
//! always lands in exactly one registry.

pub mod inbound;
pub mod media;
pub mod piped;
pub mod queued;

use crate::peer::transport::{DataChannelSink, MediaSink};
use crate::Result;
use robolink_core::bus::BusConnection;
use robolink_core::qos::QosProfile;
use robolink_workers::WorkerPool;
use std::sync::Arc;
use std::time::Duration;

pub use queued::{Coalescer, TransformCoalescer};

/// Delivery flavor for a readable topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    /// Single-latest structured data over a data channel
    Piped,
    /// Coalesced high-rate data over a best-effort data channel
    Queued,
    /// Transcoded video over a media track
    Media,
}

/// Pick the delivery flavor for a message type.
pub fn policy_for(msg_type: &str) -> RoutePolicy {
    if msg_type.ends_with("/Image")
        || msg_type.ends_with("msg/Image")
        || msg_type.ends_with("/CompressedImage")
        || msg_type.starts_with("video/")
    {
        RoutePolicy::Media
    } else if msg_type.ends_with("/TFMessage") {
        RoutePolicy::Queued
    } else {
        RoutePolicy::Piped
    }
}

/// QoS requested from the worker for a flavor.
pub fn qos_for(policy: RoutePolicy) -> QosProfile {
    match policy {
        RoutePolicy::Piped => QosProfile::default(),
        RoutePolicy::Queued => QosProfile::sensor(),
        RoutePolicy::Media => QosProfile::sensor(),
    }
}

/// Facade over the per-flavor registries
pub struct SubscriptionRouter {
    piped: piped::PipedRegistry,
    queued: queued::QueuedRegistry,
    media: media::MediaRegistry,
    inbound: inbound::InboundRegistry,
    latest_poll: Duration,
}

impl SubscriptionRouter {
    pub fn new(
        pool: Arc<WorkerPool>,
        bus: Arc<dyn BusConnection>,
        drain_interval: Duration,
    ) -> Self {
        Self {
            piped: piped::PipedRegistry::new(Arc::clone(&pool)),
            queued: queued::QueuedRegistry::new(
                Arc::clone(&pool),
                Arc::new(TransformCoalescer),
                drain_interval,
            ),
            media: media::MediaRegistry::new(pool),
            inbound: inbound::InboundRegistry::new(bus),
            latest_poll: Duration::from_millis(100),
        }
    }

    /// Open a data-channel subscription for a peer.
    pub async fn start_data(
        &self,
        policy: RoutePolicy,
        topic: &str,
        msg_type: &str,
        peer_id: &str,
        sink: Arc<dyn DataChannelSink>,
    ) -> Result<()> {
        let qos = qos_for(policy);
        match policy {
            RoutePolicy::Piped => self.piped.start(topic, msg_type, &qos, peer_id, sink).await,
            RoutePolicy::Queued => self.queued.start(topic, msg_type, &qos, peer_id, sink).await,
            RoutePolicy::Media => Err(crate::Error::Signaling(format!(
                "media topic {} cannot use a data channel",
                topic
            ))),
        }
    }

    /// Open a media subscription for a peer.
    pub async fn start_media(
        &self,
        topic: &str,
        msg_type: &str,
        peer_id: &str,
        sink: Arc<dyn MediaSink>,
    ) -> Result<()> {
        self.media
            .start(topic, msg_type, &qos_for(RoutePolicy::Media), peer_id, sink)
            .await
    }

    /// Wire a peer's write channel into the bus.
    pub async fn start_write(
        &self,
        topic: &str,
        msg_type: &str,
        peer_id: &str,
        sink: &Arc<dyn DataChannelSink>,
    ) -> Result<()> {
        self.inbound.start(topic, msg_type, peer_id, sink).await
    }

    /// Close one peer's subscription to a topic, whatever its flavor.
    pub async fn stop(&self, topic: &str, peer_id: &str) {
        self.piped.stop(topic, peer_id).await;
        self.queued.stop(topic, peer_id).await;
        self.media.stop(topic, peer_id).await;
    }

    pub async fn stop_write(&self, topic: &str, peer_id: &str) {
        self.inbound.stop(topic, peer_id).await;
    }

    /// Deliver the latest piped value once the peer's channel opens.
    pub async fn report_latest_when_ready(&self, topic: &str, peer_id: &str) {
        self.piped
            .report_latest_when_ready(topic, peer_id, self.latest_poll)
            .await;
    }

    /// Release every subscription and write hookup a peer holds.
    pub async fn remove_peer(&self, peer_id: &str) {
        self.piped.remove_peer(peer_id).await;
        self.queued.remove_peer(peer_id).await;
        self.media.remove_peer(peer_id).await;
        self.inbound.remove_peer(peer_id).await;
    }

    /// Whether any flavor currently has an upstream subscription for `topic`.
    pub async fn has_subscription(&self, topic: &str) -> bool {
        self.piped.has(topic).await || self.queued.has(topic).await || self.media.has(topic).await
    }

    #[cfg(test)]
    pub(crate) async fn media_sender_count(&self, topic: &str) -> usize {
        self.media.sender_count(topic).await
    }
}
