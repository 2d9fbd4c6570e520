//! Scripted transport for negotiation and router tests

use super::transport::{
    ConnectionState, DataChannelSink, GatheringState, MediaSample, MediaSink, PeerTransport,
    SignalingState,
};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory data channel that records what was sent through it
pub struct MockChannel {
    pub id: u16,
    pub label: String,
    pub open: AtomicBool,
    pub sent: Mutex<Vec<Vec<u8>>>,
    handler: Mutex<Option<Box<dyn Fn(Vec<u8>) + Send + Sync>>>,
}

impl MockChannel {
    /// Inject an inbound message as if the remote peer sent it.
    pub fn deliver(&self, payload: Vec<u8>) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(payload);
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl DataChannelSink for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(crate::Error::Channel {
                topic: self.label.clone(),
                reason: "not open".to_string(),
            });
        }
        self.sent.lock().push(payload.to_vec());
        Ok(())
    }

    fn on_message(&self, handler: Box<dyn Fn(Vec<u8>) + Send + Sync>) {
        *self.handler.lock() = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Media sink that records samples; can be stalled to simulate a slow peer
pub struct MockMediaSink {
    pub connected: AtomicBool,
    pub stalled: AtomicBool,
    pub samples: Mutex<Vec<MediaSample>>,
}

impl MockMediaSink {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

#[async_trait]
impl MediaSink for MockMediaSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write_sample(&self, sample: MediaSample) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            // Never completes, like a congested transport.
            futures::future::pending::<()>().await;
        }
        self.samples.lock().push(sample);
        Ok(())
    }
}

/// Scripted peer transport
pub struct MockTransport {
    pub signaling: Mutex<SignalingState>,
    pub gathering: Mutex<GatheringState>,
    pub connection: Mutex<ConnectionState>,
    pub offers_created: AtomicUsize,
    pub answers_applied: Mutex<Vec<String>>,
    pub channels: Mutex<Vec<Arc<MockChannel>>>,
    pub media_sinks: Mutex<Vec<(String, Arc<MockMediaSink>)>>,
    /// Whether newly created channels report open immediately
    pub open_new_channels: AtomicBool,
    pub closed: AtomicBool,
    local: Mutex<Option<String>>,
}

impl MockTransport {
    /// Transport that negotiates instantly (stable, gathering complete).
    pub fn new() -> Self {
        Self {
            signaling: Mutex::new(SignalingState::Stable),
            gathering: Mutex::new(GatheringState::Complete),
            connection: Mutex::new(ConnectionState::Connected),
            offers_created: AtomicUsize::new(0),
            answers_applied: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            media_sinks: Mutex::new(Vec::new()),
            open_new_channels: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            local: Mutex::new(None),
        }
    }

    pub fn offer_count(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn channel(&self, index: usize) -> Arc<MockChannel> {
        Arc::clone(&self.channels.lock()[index])
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    fn gathering_state(&self) -> GatheringState {
        *self.gathering.lock()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    async fn create_offer(&self) -> Result<String> {
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok("v=0\r\nmock-offer\r\n".to_string())
    }

    async fn set_local_description(&self, sdp: String) -> Result<()> {
        *self.local.lock() = Some(sdp);
        *self.signaling.lock() = SignalingState::HaveLocalOffer;
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        self.local.lock().clone()
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        self.answers_applied.lock().push(sdp);
        *self.signaling.lock() = SignalingState::Stable;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
        _reliable: bool,
    ) -> Result<Arc<dyn DataChannelSink>> {
        let channel = Arc::new(MockChannel {
            id,
            label: label.to_string(),
            open: AtomicBool::new(self.open_new_channels.load(Ordering::SeqCst)),
            sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn add_video_sender(&self, topic: &str) -> Result<Arc<dyn MediaSink>> {
        let sink = Arc::new(MockMediaSink::new());
        self.media_sinks
            .lock()
            .push((topic.to_string(), Arc::clone(&sink)));
        Ok(sink)
    }

    async fn remove_video_sender(&self, topic: &str) -> Result<()> {
        self.media_sinks.lock().retain(|(t, _)| t != topic);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.signaling.lock() = SignalingState::Closed;
        Ok(())
    }
}
