//! Media subscriptions
//!
//! One worker binding per topic delivers packetized access units; the
//! registry keeps one sender context per (topic, peer). Each peer gets its
//! own timestamp origin, established by the first frame actually delivered
//! to it, and a peer whose previous send has not completed is skipped for
//! the current frame so one congested transport cannot stall the rest.

use crate::peer::transport::{MediaSample, MediaSink};
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use robolink_core::ipc::MediaPacket;
use robolink_core::qos::QosProfile;
use robolink_workers::{WorkerBinding, WorkerClass, WorkerPool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Fallback sample duration when the stream has no usable timestamp delta
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(66);

struct PeerSender {
    sink: Arc<dyn MediaSink>,
    /// Worker timestamp of the first frame delivered to this peer
    origin_us: Option<u64>,
    /// Peer-relative presentation time of the last delivered frame
    last_pts_us: u64,
    /// A late joiner waits for the next keyframe before it gets anything
    awaiting_keyframe: bool,
    in_flight: Arc<AtomicBool>,
}

type SenderMap = Arc<RwLock<HashMap<String, PeerSender>>>;

struct MediaSubscription {
    senders: SenderMap,
    pump: JoinHandle<()>,
    class: WorkerClass,
}

pub(crate) struct MediaRegistry {
    pool: Arc<WorkerPool>,
    subs: RwLock<HashMap<String, MediaSubscription>>,
}

impl MediaRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            subs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start(
        &self,
        topic: &str,
        msg_type: &str,
        qos: &QosProfile,
        peer_id: &str,
        sink: Arc<dyn MediaSink>,
    ) -> Result<()> {
        let class = media_class(msg_type);
        let mut subs = self.subs.write().await;
        if let Some(sub) = subs.get(topic) {
            sub.senders
                .write()
                .await
                .entry(peer_id.to_string())
                .or_insert_with(|| PeerSender::new(sink));
            return Ok(());
        }

        let binding = self.pool.subscribe(class, topic, msg_type, qos).await?;
        let senders: SenderMap = Arc::new(RwLock::new(HashMap::from([(
            peer_id.to_string(),
            PeerSender::new(sink),
        )])));
        let pump = tokio::spawn(pump_loop(binding, Arc::clone(&senders)));
        subs.insert(
            topic.to_string(),
            MediaSubscription {
                senders,
                pump,
                class,
            },
        );
        debug!("Opened media subscription for {} ({})", topic, class);
        Ok(())
    }

    pub async fn stop(&self, topic: &str, peer_id: &str) {
        let mut subs = self.subs.write().await;
        let emptied = match subs.get(topic) {
            Some(sub) => {
                let mut senders = sub.senders.write().await;
                senders.remove(peer_id);
                senders.is_empty()
            }
            None => false,
        };
        if emptied {
            if let Some(sub) = subs.remove(topic) {
                sub.pump.abort();
                if let Err(e) = self.pool.unsubscribe(sub.class, topic).await {
                    warn!("Failed to release worker binding for {}: {}", topic, e);
                }
            }
            debug!("Closed media subscription for {}", topic);
        }
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        let topics: Vec<String> = self.subs.read().await.keys().cloned().collect();
        for topic in topics {
            self.stop(&topic, peer_id).await;
        }
    }

    pub async fn has(&self, topic: &str) -> bool {
        self.subs.read().await.contains_key(topic)
    }

    pub async fn sender_count(&self, topic: &str) -> usize {
        match self.subs.read().await.get(topic) {
            Some(sub) => sub.senders.read().await.len(),
            None => 0,
        }
    }
}

impl PeerSender {
    fn new(sink: Arc<dyn MediaSink>) -> Self {
        Self {
            sink,
            origin_us: None,
            last_pts_us: 0,
            awaiting_keyframe: true,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Worker class for a media topic: raw image types need the encoding
/// worker, everything else is treated as pre-encoded video.
pub(crate) fn media_class(msg_type: &str) -> WorkerClass {
    if msg_type.ends_with("/Image") || msg_type.ends_with("msg/Image") {
        WorkerClass::Image
    } else {
        WorkerClass::Video
    }
}

/// Join NAL packets back into one Annex-B access unit
fn assemble_annex_b(packets: &[MediaPacket]) -> Bytes {
    let total: usize = packets.iter().map(|p| p.data.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(total);
    for packet in packets {
        buf.put_slice(&[0, 0, 0, 1]);
        buf.put_slice(&packet.data);
    }
    buf.freeze()
}

async fn pump_loop(mut binding: WorkerBinding, senders: SenderMap) {
    let topic = binding.topic().to_string();
    while let Some(frame) = binding.recv().await {
        let (packets, pts_us, keyframe) = match frame {
            robolink_core::ipc::WorkerFrame::Media {
                packets,
                pts_us,
                keyframe,
                ..
            } => (packets, pts_us, keyframe),
            frame if frame.is_close() => break,
            _ => continue,
        };
        if packets.is_empty() {
            continue;
        }
        let data = assemble_annex_b(&packets);

        let mut senders = senders.write().await;
        for (peer_id, sender) in senders.iter_mut() {
            if !sender.sink.is_connected() {
                trace!("Peer {} not connected, dropping {} frame", peer_id, topic);
                continue;
            }
            if sender.awaiting_keyframe && !keyframe {
                continue;
            }
            if sender.in_flight.load(Ordering::SeqCst) {
                trace!("Peer {} still sending, dropping {} frame", peer_id, topic);
                continue;
            }

            let origin = *sender.origin_us.get_or_insert(pts_us);
            let rel_pts_us = pts_us.saturating_sub(origin);
            let delta_us = rel_pts_us.saturating_sub(sender.last_pts_us);
            let duration = if delta_us == 0 {
                DEFAULT_FRAME_DURATION
            } else {
                Duration::from_micros(delta_us)
            };
            sender.last_pts_us = rel_pts_us;
            sender.awaiting_keyframe = false;

            sender.in_flight.store(true, Ordering::SeqCst);
            let in_flight = Arc::clone(&sender.in_flight);
            let sink = Arc::clone(&sender.sink);
            let sample = MediaSample {
                data: data.clone(),
                duration,
            };
            let peer_id = peer_id.clone();
            let topic = topic.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.write_sample(sample).await {
                    trace!("Sample write failed for peer {} on {}: {}", peer_id, topic, e);
                }
                in_flight.store(false, Ordering::SeqCst);
            });
        }
    }
    debug!("Media pump for {} ended", topic);
}
