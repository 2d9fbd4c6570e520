//! Message-bus abstraction
//!
//! The gateway and every worker process own their own connection to the
//! robot's internal publish/subscribe bus. The trait keeps the gateway
//! independent of the concrete middleware; `LocalBus` is the in-process
//! implementation used by the loopback deployment mode and by tests.

use crate::qos::QosProfile;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// One message received from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Bus-level message type (e.g. `sensor_msgs/Image`)
    pub msg_type: String,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Reception timestamp, microseconds since the Unix epoch
    pub recv_ts_us: u64,
}

/// Current time in microseconds since the Unix epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// An active subscription to one topic
///
/// Dropping the subscription unsubscribes from the bus.
pub struct BusSubscription {
    topic: String,
    rx: mpsc::Receiver<BusMessage>,
    // Held so the pump task can observe the subscription going away.
    _closed_tx: mpsc::Sender<()>,
}

impl BusSubscription {
    /// Receive the next message; `None` means the topic was torn down
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Explicitly stop the subscription
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// A publisher handle for one advertised topic
#[derive(Clone)]
pub struct BusPublisher {
    topic: String,
    msg_type: String,
    tx: broadcast::Sender<BusMessage>,
}

impl BusPublisher {
    /// Publish one serialized message to the topic
    pub fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let msg = BusMessage {
            topic: self.topic.clone(),
            msg_type: self.msg_type.clone(),
            payload,
            recv_ts_us: now_us(),
        };
        // A send error only means there are currently no subscribers.
        let _ = self.tx.send(msg);
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Service handler signature for `LocalBus::register_service`
pub type ServiceHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Connection to the robot's internal message bus
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Subscribe to a topic with the given delivery policy
    async fn subscribe(
        &self,
        topic: &str,
        msg_type: &str,
        qos: &QosProfile,
    ) -> Result<BusSubscription>;

    /// Advertise a topic for publishing
    async fn advertise(&self, topic: &str, msg_type: &str, qos: &QosProfile)
        -> Result<BusPublisher>;

    /// RPC-style service call
    async fn call_service(&self, service: &str, request: Value) -> Result<Value>;
}

struct LocalTopic {
    msg_type: String,
    tx: broadcast::Sender<BusMessage>,
    /// Last message, replayed to late joiners of latched topics
    latched: Option<BusMessage>,
}

/// In-process bus implementation
///
/// Topics are broadcast channels; services are registered closures. Capacity
/// per topic is fixed, so subscribers that lag simply lose the oldest
/// entries, matching best-effort bus semantics.
pub struct LocalBus {
    topics: RwLock<HashMap<String, LocalTopic>>,
    services: RwLock<HashMap<String, ServiceHandler>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a service handler for `call_service`
    pub async fn register_service<F>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.services
            .write()
            .await
            .insert(name.to_string(), Arc::new(handler));
    }

    async fn topic_entry(&self, topic: &str, msg_type: &str) -> broadcast::Sender<BusMessage> {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!("LocalBus: creating topic {} ({})", topic, msg_type);
            let (tx, _) = broadcast::channel(self.capacity);
            LocalTopic {
                msg_type: msg_type.to_string(),
                tx,
                latched: None,
            }
        });
        if entry.msg_type != msg_type {
            warn!(
                "LocalBus: topic {} type mismatch: {} vs {}",
                topic, entry.msg_type, msg_type
            );
        }
        entry.tx.clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusConnection for LocalBus {
    async fn subscribe(
        &self,
        topic: &str,
        msg_type: &str,
        qos: &QosProfile,
    ) -> Result<BusSubscription> {
        let tx = self.topic_entry(topic, msg_type).await;
        let mut broadcast_rx = tx.subscribe();

        let depth = qos.depth();
        let (out_tx, out_rx) = mpsc::channel(depth);
        let (closed_tx, mut closed_rx) = mpsc::channel::<()>(1);

        // Replay the latched value before live traffic, if any.
        let latched = {
            let topics = self.topics.read().await;
            topics.get(topic).and_then(|t| t.latched.clone())
        };
        if let Some(msg) = latched {
            let _ = out_tx.send(msg).await;
        }

        let topic_name = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.recv() => break,
                    next = broadcast_rx.recv() => match next {
                        Ok(msg) => {
                            if out_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("LocalBus: subscriber on {} lagged {} messages", topic_name, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(BusSubscription {
            topic: topic.to_string(),
            rx: out_rx,
            _closed_tx: closed_tx,
        })
    }

    async fn advertise(
        &self,
        topic: &str,
        msg_type: &str,
        _qos: &QosProfile,
    ) -> Result<BusPublisher> {
        let tx = self.topic_entry(topic, msg_type).await;
        Ok(BusPublisher {
            topic: topic.to_string(),
            msg_type: msg_type.to_string(),
            tx,
        })
    }

    async fn call_service(&self, service: &str, request: Value) -> Result<Value> {
        let handler = {
            let services = self.services.read().await;
            services.get(service).cloned()
        };
        match handler {
            Some(h) => h(request),
            None => Err(Error::ServiceCall {
                service: service.to_string(),
                reason: "no such service".to_string(),
            }),
        }
    }
}

impl LocalBus {
    /// Publish and remember the message for late joiners (latched topics)
    pub async fn publish_latched(&self, topic: &str, msg_type: &str, payload: Vec<u8>) {
        let tx = self.topic_entry(topic, msg_type).await;
        let msg = BusMessage {
            topic: topic.to_string(),
            msg_type: msg_type.to_string(),
            payload,
            recv_ts_us: now_us(),
        };
        {
            let mut topics = self.topics.write().await;
            if let Some(entry) = topics.get_mut(topic) {
                entry.latched = Some(msg.clone());
            }
        }
        let _ = tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = LocalBus::new();
        let qos = QosProfile::default();

        let mut sub = bus.subscribe("/imu", "sensor_msgs/Imu", &qos).await.unwrap();
        let publisher = bus.advertise("/imu", "sensor_msgs/Imu", &qos).await.unwrap();

        publisher.publish(vec![1, 2, 3]).unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "/imu");
        assert_eq!(msg.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_latched_replay() {
        let bus = LocalBus::new();
        bus.publish_latched("/map", "nav_msgs/OccupancyGrid", vec![42])
            .await;

        // Subscriber joins after the publish and still sees the value.
        let mut sub = bus
            .subscribe("/map", "nav_msgs/OccupancyGrid", &QosProfile::latched())
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, vec![42]);
    }

    #[tokio::test]
    async fn test_service_call() {
        let bus = LocalBus::new();
        bus.register_service("/reboot", |req| Ok(json!({ "ok": true, "echo": req })))
            .await;

        let reply = bus.call_service("/reboot", json!({"force": false})).await.unwrap();
        assert_eq!(reply["ok"], json!(true));

        let err = bus.call_service("/missing", json!(null)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_subscription_close_stops_delivery() {
        let bus = LocalBus::new();
        let qos = QosProfile::default();
        let mut sub = bus.subscribe("/t", "std_msgs/Empty", &qos).await.unwrap();
        let publisher = bus.advertise("/t", "std_msgs/Empty", &qos).await.unwrap();

        sub.close();
        publisher.publish(vec![0]).unwrap();
        assert!(sub.recv().await.is_none());
    }
}
