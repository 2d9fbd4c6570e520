//! Write-direction routing: peer data channels publishing into the bus
//!
//! Each written topic gets one advertised bus publisher, shared by every
//! peer writing to it and released when the last writer unsubscribes.

use crate::peer::transport::DataChannelSink;
use crate::Result;
use robolink_core::bus::{BusConnection, BusPublisher};
use robolink_core::qos::QosProfile;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

struct InboundTopic {
    publisher: Arc<BusPublisher>,
    writers: HashSet<String>,
}

pub(crate) struct InboundRegistry {
    bus: Arc<dyn BusConnection>,
    topics: RwLock<HashMap<String, InboundTopic>>,
}

impl InboundRegistry {
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        Self {
            bus,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Wire a peer's inbound channel into the topic's shared publisher.
    pub async fn start(
        &self,
        topic: &str,
        msg_type: &str,
        peer_id: &str,
        sink: &Arc<dyn DataChannelSink>,
    ) -> Result<()> {
        use std::collections::hash_map::Entry;

        let mut topics = self.topics.write().await;
        let entry = match topics.entry(topic.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let publisher = self
                    .bus
                    .advertise(topic, msg_type, &QosProfile::default())
                    .await?;
                debug!("Advertised write topic {}", topic);
                slot.insert(InboundTopic {
                    publisher: Arc::new(publisher),
                    writers: HashSet::new(),
                })
            }
        };
        entry.writers.insert(peer_id.to_string());

        let publisher = Arc::clone(&entry.publisher);
        let topic_name = topic.to_string();
        sink.on_message(Box::new(move |payload| {
            if let Err(e) = publisher.publish(payload) {
                trace!("Write to {} dropped: {}", topic_name, e);
            }
        }));
        Ok(())
    }

    /// Remove a writer; the last writer releases the publisher.
    pub async fn stop(&self, topic: &str, peer_id: &str) {
        let mut topics = self.topics.write().await;
        let emptied = match topics.get_mut(topic) {
            Some(entry) => {
                entry.writers.remove(peer_id);
                entry.writers.is_empty()
            }
            None => false,
        };
        if emptied {
            topics.remove(topic);
            debug!("Released write topic {}", topic);
        }
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        let topics: Vec<String> = self.topics.read().await.keys().cloned().collect();
        for topic in topics {
            self.stop(&topic, peer_id).await;
        }
    }

    pub async fn has(&self, topic: &str) -> bool {
        self.topics.read().await.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockTransport;
    use crate::peer::transport::PeerTransport;
    use robolink_core::bus::LocalBus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_peer_writes_reach_the_bus() {
        let bus = Arc::new(LocalBus::new());
        let registry = InboundRegistry::new(Arc::clone(&bus) as Arc<dyn BusConnection>);
        let transport = MockTransport::new();
        let sink = transport.create_data_channel("/cmd_vel", 0, true).await.unwrap();

        registry.start("/cmd_vel", "geometry_msgs/Twist", "peer-a", &sink).await.unwrap();

        let mut sub = bus
            .subscribe("/cmd_vel", "geometry_msgs/Twist", &QosProfile::default())
            .await
            .unwrap();
        transport.channel(0).deliver(vec![1, 2, 3]);

        let msg = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_publisher_shared_and_refcounted() {
        let bus = Arc::new(LocalBus::new());
        let registry = InboundRegistry::new(Arc::clone(&bus) as Arc<dyn BusConnection>);
        let transport = MockTransport::new();
        let a = transport.create_data_channel("/cmd_vel", 0, true).await.unwrap();
        let b = transport.create_data_channel("/cmd_vel", 1, true).await.unwrap();

        registry.start("/cmd_vel", "geometry_msgs/Twist", "peer-a", &a).await.unwrap();
        registry.start("/cmd_vel", "geometry_msgs/Twist", "peer-b", &b).await.unwrap();

        registry.stop("/cmd_vel", "peer-a").await;
        assert!(registry.has("/cmd_vel").await);
        registry.stop("/cmd_vel", "peer-b").await;
        assert!(!registry.has("/cmd_vel").await);
    }
}
