//! Session orchestration
//!
//! The session manager owns the peer registry and translates signaling
//! events into peer mutations, router calls, and negotiation runs. Every
//! event is dispatched through one exhaustive match; there is no dynamic
//! handler registration and no global peer state.

use crate::config::GatewayConfig;
use crate::negotiation::NegotiationEngine;
use crate::ops;
use crate::peer::transport::PeerTransport;
use crate::peer::Peer;
use crate::router::SubscriptionRouter;
use crate::signaling::protocol::{
    Envelope, Outgoing, PeerParams, ServiceParams, SignalEvent,
};
use crate::Result;
use async_trait::async_trait;
use robolink_core::bus::BusConnection;
use robolink_core::directory::TopicDirectory;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Creates the transport for a newly announced peer.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn PeerTransport>>;
}

/// Production factory building real peer connections from the gateway's
/// ICE configuration.
pub struct WebRtcFactory {
    config: GatewayConfig,
}

impl WebRtcFactory {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn PeerTransport>> {
        let peer = crate::peer::webrtc::WebRtcPeer::new(peer_id.to_string(), &self.config).await?;
        Ok(Arc::new(peer))
    }
}

/// Every live peer session, keyed by peer identity
#[derive(Default)]
pub struct SessionRegistry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().await.insert(peer.id.clone(), peer);
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(peer_id)
    }

    pub async fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

pub struct SessionManager {
    registry: SessionRegistry,
    engine: Arc<NegotiationEngine>,
    router: Arc<SubscriptionRouter>,
    transports: Arc<dyn TransportFactory>,
    bus: Arc<dyn BusConnection>,
    directory: Arc<dyn TopicDirectory>,
    http: reqwest::Client,
    upload_dir: PathBuf,
    outgoing: mpsc::Sender<Outgoing>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<NegotiationEngine>,
        router: Arc<SubscriptionRouter>,
        transports: Arc<dyn TransportFactory>,
        bus: Arc<dyn BusConnection>,
        directory: Arc<dyn TopicDirectory>,
        upload_dir: PathBuf,
        outgoing: mpsc::Sender<Outgoing>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            engine,
            router,
            transports,
            bus,
            directory,
            http: reqwest::Client::new(),
            upload_dir,
            outgoing,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Dispatch one inbound signaling frame.
    pub async fn handle_event(&self, env: Envelope) {
        let peer_field = env.peer.clone();
        match env.event {
            SignalEvent::Peer(params) => self.on_peer(peer_field, env.id, params).await,
            SignalEvent::Subscribe(p) => {
                self.mutate_read_subs(peer_field, p.sources, true).await
            }
            SignalEvent::Unsubscribe(p) => {
                self.mutate_read_subs(peer_field, p.sources, false).await
            }
            SignalEvent::SubscribeWrite(p) => {
                self.on_subscribe_write(peer_field, env.id, p.sources).await
            }
            SignalEvent::UnsubscribeWrite(p) => {
                self.on_unsubscribe_write(peer_field, p.sources).await
            }
            SignalEvent::SdpAnswer(p) => self.on_answer(peer_field, p.sdp).await,
            SignalEvent::Service(p) => self.on_service(env.id, p).await,
            SignalEvent::Introspection => self.on_introspection(env.id).await,
            SignalEvent::File(url) => self.on_file(env.id, url).await,
            SignalEvent::Disconnect => {
                if let Some(peer_id) = peer_field {
                    self.teardown_peer(&peer_id).await;
                }
            }
        }
    }

    /// Reconcile a peer and push a `peer:update` offer when one comes out.
    /// Negotiation failures are logged and retried on the next event.
    pub async fn push_reconcile(&self, peer: Arc<Peer>) {
        match self.engine.reconcile(&peer).await {
            Ok(Some(manifest)) => {
                self.send(Outgoing::peer_update(peer.id.clone(), manifest)).await;
            }
            Ok(None) => {}
            Err(e) => warn!("Renegotiation for peer {} failed: {}", peer.id, e),
        }
    }

    /// Tear down every session, releasing subscriptions and channels.
    /// Used when the signaling connection drops.
    pub async fn teardown_all(&self) {
        let peers = self.registry.all().await;
        info!("Tearing down {} peer session(s)", peers.len());
        for peer in peers {
            self.teardown_peer(&peer.id).await;
        }
    }

    async fn on_peer(&self, peer_field: Option<String>, id: Option<Value>, params: PeerParams) {
        let peer_id = match params.identity().map(str::to_string).or(peer_field) {
            Some(peer_id) => peer_id,
            None => {
                warn!("Peer event without an identity, dropping");
                return;
            }
        };

        let peer = match self.registry.get(&peer_id).await {
            Some(peer) => peer,
            None => {
                let transport = match self.transports.create(&peer_id).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Transport for peer {} failed: {}", peer_id, e);
                        return;
                    }
                };
                let peer = Arc::new(Peer::new(peer_id.clone(), transport));
                info!("Peer {} connected, session {}", peer_id, peer.session_id);
                self.registry.insert(Arc::clone(&peer)).await;
                peer
            }
        };

        *peer.read_subs.write().await = params.read.into_iter().collect();
        *peer.write_subs.write().await = params.write.into_iter().collect();

        match self.engine.reconcile(&peer).await {
            Ok(Some(manifest)) => match id {
                // The sender asked for an inline reply; otherwise push.
                Some(re) => {
                    let data = serde_json::to_value(&manifest).unwrap_or(Value::Null);
                    self.send(Outgoing::reply(re, data)).await;
                }
                None => self.send(Outgoing::peer_update(peer_id, manifest)).await,
            },
            Ok(None) => {
                if let Some(re) = id {
                    self.send(Outgoing::reply(re, Value::Null)).await;
                }
            }
            Err(e) => {
                warn!("Initial reconcile for peer {} failed: {}", peer_id, e);
                if let Some(re) = id {
                    self.send(Outgoing::reply(re, Value::Null)).await;
                }
            }
        }
    }

    async fn mutate_read_subs(&self, peer_field: Option<String>, sources: Vec<String>, add: bool) {
        let Some(peer) = self.resolve(peer_field).await else {
            return;
        };
        {
            let mut subs = peer.read_subs.write().await;
            for topic in sources {
                if add {
                    subs.insert(topic);
                } else {
                    subs.remove(&topic);
                }
            }
        }
        self.push_reconcile(peer).await;
    }

    async fn on_subscribe_write(
        &self,
        peer_field: Option<String>,
        id: Option<Value>,
        sources: Vec<(String, String)>,
    ) {
        let Some(peer) = self.resolve(peer_field).await else {
            return;
        };
        peer.write_subs.write().await.extend(sources);

        match self.engine.reconcile(&peer).await {
            Ok(manifest) => {
                if let Some(re) = id {
                    let channels: Vec<Value> = peer
                        .inbound_channels
                        .read()
                        .await
                        .values()
                        .map(|h| json!([h.topic, h.id, h.msg_type]))
                        .collect();
                    self.send(Outgoing::reply(re, json!({ "write_data_channels": channels })))
                        .await;
                }
                if let Some(manifest) = manifest {
                    self.send(Outgoing::peer_update(peer.id.clone(), manifest)).await;
                }
            }
            Err(e) => {
                warn!("Write reconcile for peer {} failed: {}", peer.id, e);
                if let Some(re) = id {
                    self.send(Outgoing::error(re, "negotiation_error", e.to_string())).await;
                }
            }
        }
    }

    async fn on_unsubscribe_write(&self, peer_field: Option<String>, sources: Vec<String>) {
        let Some(peer) = self.resolve(peer_field).await else {
            return;
        };
        {
            let mut subs = peer.write_subs.write().await;
            for topic in sources {
                subs.remove(&topic);
            }
        }
        self.push_reconcile(peer).await;
    }

    async fn on_answer(&self, peer_field: Option<String>, sdp: String) {
        let Some(peer) = self.resolve(peer_field).await else {
            return;
        };
        if let Err(e) = self.engine.handle_answer(&peer, sdp).await {
            warn!("Answer from peer {} rejected: {}", peer.id, e);
        }
    }

    async fn on_service(&self, id: Option<Value>, params: ServiceParams) {
        let result = ops::call_service(self.bus.as_ref(), &params.service, params.msg).await;
        let Some(re) = id else { return };
        match result {
            Ok(data) => self.send(Outgoing::reply(re, data)).await,
            Err(e) => self.send(Outgoing::error(re, "service_error", e.to_string())).await,
        }
    }

    async fn on_introspection(&self, id: Option<Value>) {
        let Some(re) = id else { return };
        let snapshot = ops::introspect(self.directory.as_ref()).await;
        self.send(Outgoing::reply(re, snapshot)).await;
    }

    async fn on_file(&self, id: Option<Value>, url: String) {
        let result = ops::download_file(&self.http, &self.upload_dir, &url).await;
        let Some(re) = id else { return };
        match result {
            Ok(meta) => self.send(Outgoing::reply(re, meta)).await,
            Err(e) => {
                warn!("File download {} failed: {}", url, e);
                self.send(Outgoing::reply(re, Value::Null)).await;
            }
        }
    }

    async fn teardown_peer(&self, peer_id: &str) {
        let Some(peer) = self.registry.remove(peer_id).await else {
            debug!("Teardown for unknown peer {}", peer_id);
            return;
        };
        info!("Tearing down peer {}", peer_id);
        self.router.remove_peer(peer_id).await;
        peer.outbound_channels.write().await.clear();
        peer.inbound_channels.write().await.clear();
        peer.media_senders.write().await.clear();
        if let Err(e) = peer.transport.close().await {
            debug!("Closing transport for peer {}: {}", peer_id, e);
        }
    }

    async fn resolve(&self, peer_field: Option<String>) -> Option<Arc<Peer>> {
        let peer_id = peer_field?;
        let peer = self.registry.get(&peer_id).await;
        if peer.is_none() {
            warn!("Event for unknown peer {}", peer_id);
        }
        peer
    }

    async fn send(&self, frame: Outgoing) {
        if self.outgoing.send(frame).await.is_err() {
            warn!("Signaling writer is gone, dropping outbound frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NegotiationConfig;
    use crate::peer::mock::MockTransport;
    use robolink_core::bus::LocalBus;
    use robolink_core::directory::{StaticDirectory, TopicInfo};
    use robolink_workers::{InProcessLauncher, WorkerPool, WorkerSettings};
    use std::time::Duration;

    struct MockFactory {
        transports: parking_lot::Mutex<HashMap<String, Arc<MockTransport>>>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                transports: parking_lot::Mutex::new(HashMap::new()),
            }
        }

        fn get(&self, peer_id: &str) -> Arc<MockTransport> {
            Arc::clone(&self.transports.lock()[peer_id])
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(&self, peer_id: &str) -> Result<Arc<dyn PeerTransport>> {
            let transport = Arc::new(MockTransport::new());
            self.transports
                .lock()
                .insert(peer_id.to_string(), Arc::clone(&transport));
            Ok(transport)
        }
    }

    struct Fixture {
        manager: Arc<SessionManager>,
        factory: Arc<MockFactory>,
        directory: Arc<StaticDirectory>,
        router: Arc<SubscriptionRouter>,
        outgoing: mpsc::Receiver<Outgoing>,
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
            Arc::clone(&pool),
            Arc::clone(&bus) as Arc<dyn BusConnection>,
            Duration::from_millis(40),
        ));
        let directory = Arc::new(StaticDirectory::new());
        let engine = Arc::new(NegotiationEngine::new(
            Arc::clone(&router),
            Arc::clone(&directory) as Arc<dyn TopicDirectory>,
            NegotiationConfig {
                busy_wait_ms: 200,
                poll_interval_ms: 10,
                stable_wait_ms: 200,
                ice_wait_ms: 200,
                answer_wait_ms: 60_000,
            },
        ));
        let factory = Arc::new(MockFactory::new());
        let (tx, rx) = mpsc::channel(16);
        let manager = Arc::new(SessionManager::new(
            engine,
            Arc::clone(&router),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::clone(&bus) as Arc<dyn BusConnection>,
            Arc::clone(&directory) as Arc<dyn TopicDirectory>,
            std::env::temp_dir(),
            tx,
        ));
        Fixture {
            manager,
            factory,
            directory,
            router,
            outgoing: rx,
            _bus: bus,
        }
    }

    fn peer_event(peer_id: &str, read: &[&str]) -> Envelope {
        Envelope {
            event: SignalEvent::Peer(PeerParams {
                id_app: Some(peer_id.to_string()),
                id_instance: None,
                read: read.iter().map(|s| s.to_string()).collect(),
                write: vec![],
            }),
            peer: Some(peer_id.to_string()),
            id: None,
        }
    }

    fn answer_event(peer_id: &str) -> Envelope {
        Envelope {
            event: SignalEvent::SdpAnswer(crate::signaling::protocol::SdpParams {
                sdp: "v=0\r\nanswer\r\n".to_string(),
            }),
            peer: Some(peer_id.to_string()),
            id: None,
        }
    }

    #[tokio::test]
    async fn test_peer_event_creates_session_and_pushes_offer() {
        let mut fx = fixture();
        fx.directory.insert("/odom", TopicInfo::new("nav_msgs/Odometry")).await;

        fx.manager.handle_event(peer_event("alice", &["/odom"])).await;
        assert_eq!(fx.manager.registry().len().await, 1);

        let frame = fx.outgoing.recv().await.unwrap();
        match frame {
            Outgoing::PeerUpdate { peer, data, .. } => {
                assert_eq!(peer, "alice");
                assert_eq!(data.read_channels.len(), 1);
            }
            other => panic!("expected peer:update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_peer_event_replies_null_inline() {
        let mut fx = fixture();
        let mut env = peer_event("alice", &[]);
        env.id = Some(json!(3));
        fx.manager.handle_event(env).await;

        let frame = fx.outgoing.recv().await.unwrap();
        assert_eq!(frame, Outgoing::reply(json!(3), Value::Null));
        // No offer was created for an empty channel set.
        assert_eq!(fx.factory.get("alice").offer_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_topic_binding_survives_first_disconnect() {
        let mut fx = fixture();
        fx.directory.insert("/camera", TopicInfo::new("sensor_msgs/msg/Image")).await;

        fx.manager.handle_event(peer_event("alice", &["/camera"])).await;
        fx.manager.handle_event(answer_event("alice")).await;
        fx.manager.handle_event(peer_event("bob", &["/camera"])).await;
        fx.manager.handle_event(answer_event("bob")).await;
        // Drain the two offer pushes.
        fx.outgoing.recv().await.unwrap();
        fx.outgoing.recv().await.unwrap();

        assert!(fx.router.has_subscription("/camera").await);
        assert_eq!(fx.router.media_sender_count("/camera").await, 2);

        fx.manager
            .handle_event(Envelope {
                event: SignalEvent::Disconnect,
                peer: Some("alice".to_string()),
                id: None,
            })
            .await;
        assert!(fx.router.has_subscription("/camera").await);
        assert_eq!(fx.router.media_sender_count("/camera").await, 1);

        fx.manager
            .handle_event(Envelope {
                event: SignalEvent::Disconnect,
                peer: Some("bob".to_string()),
                id: None,
            })
            .await;
        assert!(!fx.router.has_subscription("/camera").await);
        assert_eq!(fx.manager.registry().len().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_write_replies_with_channel_ids() {
        let mut fx = fixture();
        fx.manager.handle_event(peer_event("alice", &[])).await;
        // Empty initial set pushes nothing.

        fx.manager
            .handle_event(Envelope {
                event: SignalEvent::SubscribeWrite(crate::signaling::protocol::WriteSourcesParams {
                    sources: vec![("/cmd_vel".to_string(), "geometry_msgs/Twist".to_string())],
                }),
                peer: Some("alice".to_string()),
                id: Some(json!(9)),
            })
            .await;

        let frame = fx.outgoing.recv().await.unwrap();
        match frame {
            Outgoing::Reply { re, data } => {
                assert_eq!(re, json!(9));
                let channels = data["write_data_channels"].as_array().unwrap();
                assert_eq!(channels.len(), 1);
                assert_eq!(channels[0][0], json!("/cmd_vel"));
                assert_eq!(channels[0][2], json!("geometry_msgs/Twist"));
            }
            other => panic!("expected reply, got {:?}", other),
        }
        // The write channel makes the set non-empty, so an offer follows.
        let frame = fx.outgoing.recv().await.unwrap();
        assert!(matches!(frame, Outgoing::PeerUpdate { .. }));
    }

    #[tokio::test]
    async fn test_introspection_reply() {
        let mut fx = fixture();
        fx.directory.insert("/imu", TopicInfo::new("sensor_msgs/Imu")).await;
        fx.manager
            .handle_event(Envelope {
                event: SignalEvent::Introspection,
                peer: Some("alice".to_string()),
                id: Some(json!("i1")),
            })
            .await;

        let frame = fx.outgoing.recv().await.unwrap();
        match frame {
            Outgoing::Reply { re, data } => {
                assert_eq!(re, json!("i1"));
                assert_eq!(data["topics"]["/imu"], json!("sensor_msgs/Imu"));
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_teardown_all_clears_registry() {
        let mut fx = fixture();
        fx.directory.insert("/odom", TopicInfo::new("nav_msgs/Odometry")).await;
        fx.manager.handle_event(peer_event("alice", &["/odom"])).await;
        fx.manager.handle_event(peer_event("bob", &["/odom"])).await;
        fx.outgoing.recv().await.unwrap();
        fx.outgoing.recv().await.unwrap();
        assert_eq!(fx.manager.registry().len().await, 2);

        fx.manager.teardown_all().await;
        assert_eq!(fx.manager.registry().len().await, 0);
        assert!(!fx.router.has_subscription("/odom").await);
    }
}
