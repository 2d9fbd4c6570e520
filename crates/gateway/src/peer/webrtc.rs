//! WebRTC implementation of the peer transport seam

use super::transport::{
    ConnectionState, DataChannelSink, GatheringState, MediaSample, MediaSink, PeerTransport,
    SignalingState,
};
use crate::config::GatewayConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// WebRTC peer connection wrapper implementing [`PeerTransport`]
pub struct WebRtcPeer {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Mirrors the connection state for sync accessors and media sinks
    connection_state: Arc<parking_lot::RwLock<ConnectionState>>,
    /// Set once ICE gathering for the current description completes
    gathering_complete: Arc<AtomicBool>,
    /// Video senders by topic, retained so tracks are not collected
    video_senders: RwLock<HashMap<String, Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    /// Create a new peer connection from the gateway's ICE configuration.
    pub async fn new(peer_id: String, config: &GatewayConfig) -> Result<Self> {
        info!("Creating peer connection: peer_id={}", peer_id);

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Transport(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::Transport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::Transport(format!("Failed to create peer connection: {}", e)))?,
        );

        let connection_state = Arc::new(parking_lot::RwLock::new(ConnectionState::New));
        let state_clone = Arc::clone(&connection_state);
        let peer_id_clone = peer_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state_clone = Arc::clone(&state_clone);
                let peer_id = peer_id_clone.clone();
                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    let mut state = state_clone.write();
                    if *state != new_state {
                        debug!("Peer {} connection: {:?} -> {:?}", peer_id, *state, new_state);
                        *state = new_state;
                    }
                })
            },
        ));

        Ok(Self {
            peer_id,
            peer_connection,
            connection_state,
            gathering_complete: Arc::new(AtomicBool::new(false)),
            video_senders: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            _ => SignalingState::Closed,
        }
    }

    fn gathering_state(&self) -> GatheringState {
        if self.gathering_complete.load(Ordering::SeqCst) {
            GatheringState::Complete
        } else {
            GatheringState::Gathering
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read()
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Transport(format!("Failed to create offer: {}", e)))?;
        debug!("Created SDP offer for peer {}", self.peer_id);
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::SetDescription(format!("Failed to parse offer: {}", e)))?;

        // Arm the gathering flag before the description is in place so the
        // completion signal cannot be missed.
        self.gathering_complete.store(false, Ordering::SeqCst);
        let mut gathered = self.peer_connection.gathering_complete_promise().await;
        let flag = Arc::clone(&self.gathering_complete);
        tokio::spawn(async move {
            let _ = gathered.recv().await;
            flag.store(true, Ordering::SeqCst);
        });

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SetDescription(format!("Failed to set local description: {}", e)))
    }

    async fn local_description(&self) -> Option<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SetDescription(format!("Failed to parse answer: {}", e)))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SetDescription(format!("Failed to set remote description: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
        reliable: bool,
    ) -> Result<Arc<dyn DataChannelSink>> {
        let init = RTCDataChannelInit {
            ordered: Some(reliable),
            max_retransmits: if reliable { None } else { Some(0) },
            negotiated: Some(id),
            ..Default::default()
        };

        let rtc_channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| Error::Transport(format!("Failed to create data channel: {}", e)))?;

        Ok(Arc::new(WebRtcDataChannel::new(id, label, rtc_channel)))
    }

    async fn add_video_sender(&self, topic: &str) -> Result<Arc<dyn MediaSink>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                ..Default::default()
            },
            topic.trim_start_matches('/').replace('/', "_"),
            "robolink".to_string(),
        ));

        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::Transport(format!("Failed to add video track: {}", e)))?;

        self.video_senders
            .write()
            .await
            .insert(topic.to_string(), sender);
        info!("Added video sender for {} to peer {}", topic, self.peer_id);

        Ok(Arc::new(WebRtcMediaSink {
            track,
            connection_state: Arc::clone(&self.connection_state),
        }))
    }

    async fn remove_video_sender(&self, topic: &str) -> Result<()> {
        if let Some(sender) = self.video_senders.write().await.remove(topic) {
            self.peer_connection
                .remove_track(&sender)
                .await
                .map_err(|e| Error::Transport(format!("Failed to remove video track: {}", e)))?;
            debug!("Removed video sender for {} from peer {}", topic, self.peer_id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::Transport(format!("Failed to close peer connection: {}", e)))?;
        info!("Closed peer connection for {}", self.peer_id);
        Ok(())
    }
}

/// Data channel wrapper tracking open/closed through channel callbacks
struct WebRtcDataChannel {
    id: u16,
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
    open: Arc<AtomicBool>,
}

impl WebRtcDataChannel {
    fn new(id: u16, label: &str, rtc_channel: Arc<RTCDataChannel>) -> Self {
        let open = Arc::new(AtomicBool::new(false));

        let open_flag = Arc::clone(&open);
        let open_label = label.to_string();
        rtc_channel.on_open(Box::new(move || {
            let open_flag = Arc::clone(&open_flag);
            let label = open_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                open_flag.store(true, Ordering::SeqCst);
            })
        }));

        let close_flag = Arc::clone(&open);
        let close_label = label.to_string();
        rtc_channel.on_close(Box::new(move || {
            let close_flag = Arc::clone(&close_flag);
            let label = close_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                close_flag.store(false, Ordering::SeqCst);
            })
        }));

        let error_label = label.to_string();
        rtc_channel.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                warn!("Data channel '{}' error: {}", label, err);
            })
        }));

        Self {
            id,
            label: label.to_string(),
            rtc_channel,
            open,
        }
    }
}

#[async_trait]
impl DataChannelSink for WebRtcDataChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Channel {
                topic: self.label.clone(),
                reason: "not open".to_string(),
            });
        }
        self.rtc_channel
            .send(&payload.to_vec().into())
            .await
            .map_err(|e| Error::Channel {
                topic: self.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn on_message(&self, handler: Box<dyn Fn(Vec<u8>) + Send + Sync>) {
        self.rtc_channel.on_message(Box::new(move |msg| {
            handler(msg.data.to_vec());
            Box::pin(async {})
        }));
    }

    async fn close(&self) -> Result<()> {
        self.rtc_channel.close().await.map_err(|e| Error::Channel {
            topic: self.label.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Video sender writing Annex-B access units onto a sample track
struct WebRtcMediaSink {
    track: Arc<TrackLocalStaticSample>,
    connection_state: Arc<parking_lot::RwLock<ConnectionState>>,
}

#[async_trait]
impl MediaSink for WebRtcMediaSink {
    fn is_connected(&self) -> bool {
        *self.connection_state.read() == ConnectionState::Connected
    }

    async fn write_sample(&self, sample: MediaSample) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data: sample.data,
                duration: sample.duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Transport(format!("Failed to write sample: {}", e)))
    }
}
