//! Piped single-latest subscriptions
//!
//! One worker subscription per topic, fanned out to every open peer data
//! channel. Only the newest message matters: a sink whose transport is not
//! open simply misses the value, except through the explicit
//! latest-when-ready path used for reliable topics.

use crate::peer::transport::DataChannelSink;
use crate::Result;
use robolink_core::qos::QosProfile;
use robolink_workers::{WorkerBinding, WorkerClass, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type SinkMap = Arc<RwLock<HashMap<String, Arc<dyn DataChannelSink>>>>;

struct PipedSubscription {
    sinks: SinkMap,
    latest: watch::Receiver<Option<Vec<u8>>>,
    pump: JoinHandle<()>,
}

pub(crate) struct PipedRegistry {
    pool: Arc<WorkerPool>,
    subs: RwLock<HashMap<String, PipedSubscription>>,
}

impl PipedRegistry {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a sink; opens the worker binding on the first sink for the
    /// topic. Idempotent per (topic, peer).
    pub async fn start(
        &self,
        topic: &str,
        msg_type: &str,
        qos: &QosProfile,
        peer_id: &str,
        sink: Arc<dyn DataChannelSink>,
    ) -> Result<()> {
        let mut subs = self.subs.write().await;
        if let Some(sub) = subs.get(topic) {
            sub.sinks.write().await.insert(peer_id.to_string(), sink);
            return Ok(());
        }

        let binding = self
            .pool
            .subscribe(WorkerClass::Data, topic, msg_type, qos)
            .await?;
        let (tx, rx) = watch::channel(None);
        let sinks: SinkMap = Arc::new(RwLock::new(HashMap::from([(
            peer_id.to_string(),
            sink,
        )])));
        let pump = tokio::spawn(pump_loop(binding, tx, Arc::clone(&sinks)));
        subs.insert(
            topic.to_string(),
            PipedSubscription {
                sinks,
                latest: rx,
                pump,
            },
        );
        debug!("Opened piped subscription for {}", topic);
        Ok(())
    }

    /// Detach a sink; the last sink closes the worker binding. A no-op for
    /// unknown topics or peers.
    pub async fn stop(&self, topic: &str, peer_id: &str) {
        let mut subs = self.subs.write().await;
        let emptied = match subs.get(topic) {
            Some(sub) => {
                let mut sinks = sub.sinks.write().await;
                sinks.remove(peer_id);
                sinks.is_empty()
            }
            None => false,
        };
        if emptied {
            if let Some(sub) = subs.remove(topic) {
                sub.pump.abort();
            }
            if let Err(e) = self.pool.unsubscribe(WorkerClass::Data, topic).await {
                warn!("Failed to release worker binding for {}: {}", topic, e);
            }
            debug!("Closed piped subscription for {}", topic);
        }
    }

    /// Deliver the latest value once the peer's channel opens.
    ///
    /// Polls until the sink's transport opens or the sink is removed, then
    /// delivers the stored value, if one exists at that moment, exactly
    /// once and stops.
    pub async fn report_latest_when_ready(&self, topic: &str, peer_id: &str, poll: Duration) {
        let subs = self.subs.read().await;
        let sub = match subs.get(topic) {
            Some(sub) => sub,
            None => return,
        };
        let latest = sub.latest.clone();
        let sinks = Arc::clone(&sub.sinks);
        let peer_id = peer_id.to_string();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                let sink = match sinks.read().await.get(&peer_id) {
                    Some(sink) => Arc::clone(sink),
                    None => break,
                };
                if sink.is_open() {
                    // Once the channel is open the live fan-out covers it;
                    // deliver whatever is stored right now and stop, or a
                    // later value would arrive twice.
                    let value = latest.borrow().clone();
                    if let Some(payload) = value {
                        if let Err(e) = sink.send(&payload).await {
                            trace!("Latest-when-ready send failed on {}: {}", topic, e);
                        }
                    }
                    break;
                }
                tokio::time::sleep(poll).await;
            }
        });
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

    pub async fn sink_count(&self, topic: &str) -> usize {
        match self.subs.read().await.get(topic) {
            Some(sub) => sub.sinks.read().await.len(),
            None => 0,
        }
    }
}

async fn pump_loop(
    mut binding: WorkerBinding,
    latest: watch::Sender<Option<Vec<u8>>>,
    sinks: SinkMap,
) {
    let topic = binding.topic().to_string();
    while let Some(frame) = binding.recv().await {
        let payload = match frame {
            robolink_core::ipc::WorkerFrame::Data {
                msg: Some(payload), ..
            } => payload,
            frame if frame.is_close() => break,
            _ => continue,
        };
        let _ = latest.send(Some(payload.clone()));
        for (peer_id, sink) in sinks.read().await.iter() {
            if !sink.is_open() {
                continue;
            }
            if let Err(e) = sink.send(&payload).await {
                trace!("Dropping {} for peer {}: {}", topic, peer_id, e);
            }
        }
    }
    debug!("Piped pump for {} ended", topic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockTransport;
    use crate::peer::transport::PeerTransport;
    use robolink_core::bus::{BusConnection, LocalBus};
    use robolink_workers::{InProcessLauncher, WorkerSettings};

    async fn registry() -> (PipedRegistry, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        let launcher = InProcessLauncher::new(
            Arc::clone(&bus) as Arc<dyn BusConnection>,
            WorkerSettings::default(),
        );
        let pool = Arc::new(WorkerPool::new(Box::new(launcher)));
        (PipedRegistry::new(pool), bus)
    }

    #[tokio::test]
    async fn test_fan_out_to_open_sinks() {
        let (registry, bus) = registry().await;
        let transport = MockTransport::new();
        let a = transport.create_data_channel("/odom", 0, true).await.unwrap();
        let b = transport.create_data_channel("/odom", 1, true).await.unwrap();
        let qos = QosProfile::default();

        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-a", a).await.unwrap();
        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-b", b).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let publisher = bus.advertise("/odom", "nav_msgs/Odometry", &qos).await.unwrap();
        publisher.publish(vec![7]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.channel(0).sent_count(), 1);
        assert_eq!(transport.channel(1).sent_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_start_does_not_duplicate() {
        let (registry, bus) = registry().await;
        let transport = MockTransport::new();
        let sink = transport.create_data_channel("/odom", 0, true).await.unwrap();
        let qos = QosProfile::default();

        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-a", Arc::clone(&sink)).await.unwrap();
        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-a", sink).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let publisher = bus.advertise("/odom", "nav_msgs/Odometry", &qos).await.unwrap();
        publisher.publish(vec![7]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.channel(0).sent_count(), 1);
    }

    #[tokio::test]
    async fn test_refcount_releases_on_last_sink() {
        let (registry, _bus) = registry().await;
        let transport = MockTransport::new();
        let a = transport.create_data_channel("/odom", 0, true).await.unwrap();
        let b = transport.create_data_channel("/odom", 1, true).await.unwrap();
        let qos = QosProfile::default();

        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-a", a).await.unwrap();
        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-b", b).await.unwrap();

        registry.stop("/odom", "peer-a").await;
        assert!(registry.has("/odom").await);
        registry.stop("/odom", "peer-b").await;
        assert!(!registry.has("/odom").await);

        // Stop on an unknown sink is a no-op.
        registry.stop("/odom", "peer-c").await;

        // Re-subscribing afterward creates a fresh binding.
        let c = transport.create_data_channel("/odom", 2, true).await.unwrap();
        registry.start("/odom", "nav_msgs/Odometry", &qos, "peer-c", c).await.unwrap();
        assert!(registry.has("/odom").await);
    }

    #[tokio::test]
    async fn test_latest_when_ready_delivers_once_open() {
        let (registry, bus) = registry().await;
        let transport = MockTransport::new();
        transport.open_new_channels.store(false, std::sync::atomic::Ordering::SeqCst);
        let sink = transport.create_data_channel("/status", 0, true).await.unwrap();
        let qos = QosProfile::latched();

        registry.start("/status", "std_msgs/String", &qos, "peer-a", sink).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let publisher = bus.advertise("/status", "std_msgs/String", &qos).await.unwrap();
        publisher.publish(b"ok".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Channel closed: the live push was dropped.
        assert_eq!(transport.channel(0).sent_count(), 0);

        registry.report_latest_when_ready("/status", "peer-a", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.channel(0).sent_count(), 0);

        // Once the transport opens, the latest value arrives exactly once.
        transport.channel(0).open.store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.channel(0).sent_count(), 1);
    }

    #[tokio::test]
    async fn test_latest_when_ready_never_duplicates_live_push() {
        let (registry, bus) = registry().await;
        let transport = MockTransport::new();
        let sink = transport.create_data_channel("/status", 0, true).await.unwrap();
        let qos = QosProfile::latched();

        registry.start("/status", "std_msgs/String", &qos, "peer-a", sink).await.unwrap();
        // Channel already open with nothing published yet: the catch-up
        // task must stand down rather than wait for a first value.
        registry.report_latest_when_ready("/status", "peer-a", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let publisher = bus.advertise("/status", "std_msgs/String", &qos).await.unwrap();
        publisher.publish(b"ok".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Only the live fan-out delivered it.
        assert_eq!(transport.channel(0).sent_count(), 1);
    }
}
