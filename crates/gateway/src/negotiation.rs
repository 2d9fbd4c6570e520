//! Peer negotiation engine
//!
//! Reconciles a peer's desired topic sets against its open channels, then
//! drives the offer/answer cycle: bounded single-flight acquisition, channel
//! diffing through the router, the empty-set short-circuit, bounded waits
//! for stable signaling and ICE completion, and strict answer validation.
//! Every failure is recoverable; the peer stays connected and the next
//! signaling event retries.

use crate::config::NegotiationConfig;
use crate::peer::transport::SignalingState;
use crate::peer::{ChannelDirection, ChannelHandle, NegotiationState, Peer};
use crate::router::{policy_for, RoutePolicy, SubscriptionRouter};
use crate::{Error, Result};
use robolink_core::directory::TopicDirectory;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One negotiated data channel, as reported to the peer
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelInfo {
    pub topic: String,
    pub id: u16,
    pub msg_type: String,
}

/// Everything a peer needs to complete the negotiation
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OfferManifest {
    pub session_id: String,
    pub sdp: String,
    pub read_channels: Vec<ChannelInfo>,
    pub write_channels: Vec<ChannelInfo>,
    pub media_topics: Vec<String>,
}

/// Releases the peer's single-flight guard unless the offer is awaiting an
/// answer, in which case `handle_answer` releases it.
struct FlightGuard<'a> {
    peer: &'a Peer,
    armed: bool,
}

impl<'a> FlightGuard<'a> {
    fn new(peer: &'a Peer) -> Self {
        Self { peer, armed: true }
    }

    /// Keep the guard held past this reconciliation.
    fn hold_for_answer(mut self) {
        self.armed = false;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.peer.release();
        }
    }
}

pub struct NegotiationEngine {
    router: Arc<SubscriptionRouter>,
    directory: Arc<dyn TopicDirectory>,
    config: NegotiationConfig,
}

impl NegotiationEngine {
    pub fn new(
        router: Arc<SubscriptionRouter>,
        directory: Arc<dyn TopicDirectory>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            router,
            directory,
            config,
        }
    }

    /// Bring the peer's channels in line with its desired topic sets and,
    /// when any channel is open afterward, produce a fresh offer.
    ///
    /// `Ok(None)` means no renegotiation was needed (no open channels, so no
    /// offer is generated; an offer with zero media/data lines is invalid).
    pub async fn reconcile(&self, peer: &Arc<Peer>) -> Result<Option<OfferManifest>> {
        self.acquire(peer).await?;
        let guard = FlightGuard::new(peer);
        peer.set_state(NegotiationState::Processing).await;

        let result = self.reconcile_inner(peer).await;
        match &result {
            Ok(Some(_)) => {
                peer.set_state(NegotiationState::WaitingAnswer).await;
                guard.hold_for_answer();
            }
            Ok(None) => {
                peer.set_state(NegotiationState::Idle).await;
            }
            Err(e) => {
                warn!("Reconcile failed for peer {}: {}", peer.id, e);
                peer.set_state(NegotiationState::Failed).await;
            }
        }
        result
    }

    /// Apply the peer's answer to an outstanding offer.
    ///
    /// Rejected without side effects unless the transport is exactly in
    /// have-local-offer.
    pub async fn handle_answer(&self, peer: &Arc<Peer>, sdp: String) -> Result<()> {
        let state = peer.transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(Error::StaleAnswer {
                peer: peer.id.clone(),
                state: state.as_str().to_string(),
            });
        }

        if let Err(e) = peer.transport.apply_answer(sdp).await {
            peer.set_state(NegotiationState::Failed).await;
            peer.release();
            return Err(e);
        }

        peer.set_state(NegotiationState::Stable).await;
        peer.release();
        info!("Negotiation complete for peer {}", peer.id);
        Ok(())
    }

    /// Take the single-flight guard within the busy-wait budget.
    async fn acquire(&self, peer: &Peer) -> Result<()> {
        let deadline = Instant::now() + self.config.busy_wait();
        loop {
            if peer.try_acquire() {
                return Ok(());
            }
            // A holder stuck past the answer budget forfeits the guard, so
            // a peer that never answers cannot wedge itself permanently.
            if let Some(elapsed) = peer.processing_elapsed() {
                if elapsed > self.config.answer_wait() {
                    warn!(
                        "Reclaiming stale negotiation guard for peer {} after {:?}",
                        peer.id, elapsed
                    );
                    peer.release();
                    continue;
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Busy(peer.id.clone()));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn reconcile_inner(&self, peer: &Arc<Peer>) -> Result<Option<OfferManifest>> {
        self.sync_read_channels(peer).await?;
        self.sync_write_channels(peer).await?;

        if !peer.has_open_channels().await {
            debug!("Peer {} has no open channels, skipping offer", peer.id);
            return Ok(None);
        }

        let sdp = self.drive_offer(peer).await?;
        Ok(Some(self.build_manifest(peer, sdp).await))
    }

    /// Open and close read-direction channels to match `read_subs`.
    async fn sync_read_channels(&self, peer: &Arc<Peer>) -> Result<()> {
        let desired: HashSet<String> = peer.read_subs.read().await.clone();

        // Closures first, so a type change can tear down before reopening.
        let stale_data: Vec<String> = peer
            .outbound_channels
            .read()
            .await
            .keys()
            .filter(|t| !desired.contains(*t))
            .cloned()
            .collect();
        for topic in stale_data {
            self.router.stop(&topic, &peer.id).await;
            if let Some(handle) = peer.outbound_channels.write().await.remove(&topic) {
                if let Err(e) = handle.sink.close().await {
                    debug!("Closing channel for {} failed: {}", topic, e);
                }
            }
        }
        let stale_media: Vec<String> = peer
            .media_senders
            .read()
            .await
            .keys()
            .filter(|t| !desired.contains(*t))
            .cloned()
            .collect();
        for topic in stale_media {
            self.router.stop(&topic, &peer.id).await;
            peer.media_senders.write().await.remove(&topic);
            if let Err(e) = peer.transport.remove_video_sender(&topic).await {
                debug!("Removing video sender for {} failed: {}", topic, e);
            }
        }

        let mut pending = HashSet::new();
        for topic in desired {
            if peer.outbound_channels.read().await.contains_key(&topic)
                || peer.media_senders.read().await.contains_key(&topic)
            {
                continue;
            }
            let info = match self.directory.get(&topic).await {
                Some(info) => info,
                None => {
                    debug!("Topic {} not yet discovered, queued for peer {}", topic, peer.id);
                    pending.insert(topic);
                    continue;
                }
            };

            match policy_for(&info.msg_type) {
                RoutePolicy::Media => {
                    let sink = peer.transport.add_video_sender(&topic).await?;
                    self.router
                        .start_media(&topic, &info.msg_type, &peer.id, Arc::clone(&sink))
                        .await?;
                    peer.media_senders.write().await.insert(topic, sink);
                }
                policy => {
                    let id = peer.next_channel_id();
                    let reliable = policy == RoutePolicy::Piped;
                    let sink = peer.transport.create_data_channel(&topic, id, reliable).await?;
                    self.router
                        .start_data(policy, &topic, &info.msg_type, &peer.id, Arc::clone(&sink))
                        .await?;
                    if reliable {
                        // The channel opens only after the connection comes
                        // up; the current value follows it.
                        self.router.report_latest_when_ready(&topic, &peer.id).await;
                    }
                    peer.outbound_channels.write().await.insert(
                        topic.clone(),
                        ChannelHandle {
                            id,
                            topic,
                            msg_type: info.msg_type.clone(),
                            direction: ChannelDirection::Outbound,
                            reliable,
                            sink,
                        },
                    );
                }
            }
        }
        *peer.pending_topics.write().await = pending;
        Ok(())
    }

    /// Open and close write-direction channels to match `write_subs`.
    async fn sync_write_channels(&self, peer: &Arc<Peer>) -> Result<()> {
        let desired = peer.write_subs.read().await.clone();

        let stale: Vec<String> = peer
            .inbound_channels
            .read()
            .await
            .keys()
            .filter(|t| !desired.contains_key(*t))
            .cloned()
            .collect();
        for topic in stale {
            self.router.stop_write(&topic, &peer.id).await;
            if let Some(handle) = peer.inbound_channels.write().await.remove(&topic) {
                if let Err(e) = handle.sink.close().await {
                    debug!("Closing write channel for {} failed: {}", topic, e);
                }
            }
        }

        for (topic, msg_type) in desired {
            if peer.inbound_channels.read().await.contains_key(&topic) {
                continue;
            }
            let id = peer.next_channel_id();
            let sink = peer.transport.create_data_channel(&topic, id, true).await?;
            self.router.start_write(&topic, &msg_type, &peer.id, &sink).await?;
            peer.inbound_channels.write().await.insert(
                topic.clone(),
                ChannelHandle {
                    id,
                    topic,
                    msg_type,
                    direction: ChannelDirection::Inbound,
                    reliable: true,
                    sink,
                },
            );
        }
        Ok(())
    }

    /// Offer creation with bounded waits for stable signaling and ICE.
    async fn drive_offer(&self, peer: &Arc<Peer>) -> Result<String> {
        peer.set_state(NegotiationState::AwaitingStableSignaling).await;
        self.wait_for(
            || peer.transport.signaling_state() == SignalingState::Stable,
            self.config.stable_wait(),
        )
        .await
        .then_some(())
        .ok_or_else(|| Error::NegotiationTimeout(peer.id.clone()))?;

        let offer = peer.transport.create_offer().await?;
        peer.transport.set_local_description(offer).await?;
        peer.set_state(NegotiationState::OfferCreated).await;

        peer.set_state(NegotiationState::AwaitingIce).await;
        self.wait_for(
            || peer.transport.gathering_state() == crate::peer::transport::GatheringState::Complete,
            self.config.ice_wait(),
        )
        .await
        .then_some(())
        .ok_or_else(|| Error::IceTimeout(peer.id.clone()))?;

        peer.transport
            .local_description()
            .await
            .ok_or_else(|| Error::SetDescription("no local description after offer".to_string()))
    }

    async fn wait_for(&self, mut ready: impl FnMut() -> bool, budget: std::time::Duration) -> bool {
        let deadline = Instant::now() + budget;
        while !ready() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        true
    }

    async fn build_manifest(&self, peer: &Arc<Peer>, sdp: String) -> OfferManifest {
        let read_channels = channel_infos(&*peer.outbound_channels.read().await);
        let write_channels = channel_infos(&*peer.inbound_channels.read().await);
        let media_topics: Vec<String> = peer.media_senders.read().await.keys().cloned().collect();
        OfferManifest {
            session_id: peer.session_id.clone(),
            sdp,
            read_channels,
            write_channels,
            media_topics,
        }
    }
}

fn channel_infos(channels: &std::collections::HashMap<String, ChannelHandle>) -> Vec<ChannelInfo> {
    let mut infos: Vec<ChannelInfo> = channels
        .values()
        .map(|handle| ChannelInfo {
            topic: handle.topic.clone(),
            id: handle.id,
            msg_type: handle.msg_type.clone(),
        })
        .collect();
    infos.sort_by_key(|info| info.id);
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockTransport;
    use crate::peer::transport::DataChannelSink;
    use robolink_core::bus::{BusConnection, LocalBus};
    use robolink_core::directory::{StaticDirectory, TopicInfo};
    use robolink_workers::{InProcessLauncher, WorkerPool, WorkerSettings};
    use std::time::Duration;

    fn fast_config() -> NegotiationConfig {
        NegotiationConfig {
            busy_wait_ms: 200,
            poll_interval_ms: 10,
            stable_wait_ms: 200,
            ice_wait_ms: 200,
            answer_wait_ms: 60_000,
        }
    }

    struct Fixture {
        engine: NegotiationEngine,
        directory: Arc<StaticDirectory>,
        _bus: Arc<LocalBus>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(LocalBus::new());
        let launcher = InProcessLauncher::new(
            Arc::clone(&bus) as Arc<dyn BusConnection>,
            WorkerSettings::default(),
        );
        let pool = Arc::new(WorkerPool::new(Box::new(launcher)));
        let router = Arc::new(SubscriptionRouter::new(
            pool,
            Arc::clone(&bus) as Arc<dyn BusConnection>,
            Duration::from_millis(40),
        ));
        let directory = Arc::new(StaticDirectory::new());
        let engine = NegotiationEngine::new(
            router,
            Arc::clone(&directory) as Arc<dyn TopicDirectory>,
            fast_config(),
        );
        Fixture {
            engine,
            directory,
            _bus: bus,
        }
    }

    #[tokio::test]
    async fn test_no_offer_when_empty() {
        let fx = fixture();
        let transport = Arc::new(MockTransport::new());
        let peer = Arc::new(Peer::new("p1", Arc::clone(&transport) as Arc<_>));

        let manifest = fx.engine.reconcile(&peer).await.unwrap();
        assert!(manifest.is_none());
        assert_eq!(transport.offer_count(), 0);
        assert_eq!(peer.state().await, NegotiationState::Idle);
        // Guard was released.
        assert!(peer.try_acquire());
    }

    #[tokio::test]
    async fn test_undiscovered_topic_queued_then_opened() {
        let fx = fixture();
        let transport = Arc::new(MockTransport::new());
        let peer = Arc::new(Peer::new("p1", Arc::clone(&transport) as Arc<_>));
        peer.read_subs.write().await.insert("/imu".to_string());

        // Unknown topic: no offer, queued as pending.
        let manifest = fx.engine.reconcile(&peer).await.unwrap();
        assert!(manifest.is_none());
        assert!(peer.pending_topics.read().await.contains("/imu"));
        assert_eq!(transport.offer_count(), 0);

        // Discovery learns the type; the next pass opens the channel.
        fx.directory.insert("/imu", TopicInfo::new("sensor_msgs/Imu")).await;
        let manifest = fx.engine.reconcile(&peer).await.unwrap().unwrap();
        assert_eq!(manifest.read_channels.len(), 1);
        assert_eq!(manifest.read_channels[0].topic, "/imu");
        assert!(peer.pending_topics.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_single_flight_busy() {
        let fx = fixture();
        let transport = Arc::new(MockTransport::new());
        let peer = Arc::new(Peer::new("p1", Arc::clone(&transport) as Arc<_>));

        assert!(peer.try_acquire());
        let err = fx.engine.reconcile(&peer).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        peer.release();
    }

    #[tokio::test]
    async fn test_offer_answer_cycle() {
        let fx = fixture();
        fx.directory.insert("/odom", TopicInfo::new("nav_msgs/Odometry")).await;
        let transport = Arc::new(MockTransport::new());
        let peer = Arc::new(Peer::new("p1", Arc::clone(&transport) as Arc<_>));
        peer.read_subs.write().await.insert("/odom".to_string());

        let manifest = fx.engine.reconcile(&peer).await.unwrap().unwrap();
        assert!(!manifest.sdp.is_empty());
        assert_eq!(peer.state().await, NegotiationState::WaitingAnswer);
        // Guard is held while the answer is outstanding.
        assert!(!peer.try_acquire());

        fx.engine
            .handle_answer(&peer, "v=0\r\nanswer\r\n".to_string())
            .await
            .unwrap();
        assert_eq!(peer.state().await, NegotiationState::Stable);
        assert_eq!(transport.answers_applied.lock().len(), 1);
        assert!(peer.try_acquire());
        peer.release();
    }

    #[tokio::test]
    async fn test_stale_answer_rejected_without_side_effects() {
        let fx = fixture();
        let transport = Arc::new(MockTransport::new());
        let peer = Arc::new(Peer::new("p1", Arc::clone(&transport) as Arc<_>));

        // Signaling is stable, not have-local-offer.
        let err = fx
            .engine
            .handle_answer(&peer, "v=0\r\nanswer\r\n".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleAnswer { .. }));
        assert!(transport.answers_applied.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channels() {
        let fx = fixture();
        fx.directory.insert("/odom", TopicInfo::new("nav_msgs/Odometry")).await;
        let transport = Arc::new(MockTransport::new());
        let peer = Arc::new(Peer::new("p1", Arc::clone(&transport) as Arc<_>));
        peer.read_subs.write().await.insert("/odom".to_string());

        fx.engine.reconcile(&peer).await.unwrap().unwrap();
        fx.engine
            .handle_answer(&peer, "v=0\r\nanswer\r\n".to_string())
            .await
            .unwrap();
        assert!(peer.outbound_channels.read().await.contains_key("/odom"));

        peer.read_subs.write().await.clear();
        let manifest = fx.engine.reconcile(&peer).await.unwrap();
        assert!(manifest.is_none());
        assert!(peer.outbound_channels.read().await.is_empty());
        assert!(!transport.channel(0).is_open());
    }
}
