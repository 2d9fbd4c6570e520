//! Queued/coalesced subscriptions
//!
//! For very high-rate, key-decomposable topics. Incoming messages are split
//! into keyed entries; within one drain interval only the newest entry per
//! key survives, bounding staleness under bursts without unbounded memory.

use crate::peer::transport::DataChannelSink;
use crate::Result;
use robolink_core::qos::QosProfile;
use robolink_workers::{WorkerBinding, WorkerClass, WorkerPool};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Upper bound on distinct keys held between drains
const MAX_PENDING_KEYS: usize = 1024;

/// Key extraction and reassembly for one coalescable message family
pub trait Coalescer: Send + Sync {
    /// Split a raw message into keyed entries. An empty result drops the
    /// message.
    fn split(&self, payload: &[u8]) -> Vec<(String, Value)>;

    /// Reassemble surviving entries into one outgoing payload.
    fn assemble(&self, entries: Vec<Value>) -> Result<Vec<u8>>;
}

/// Coalesces transform-tree messages by parent+child frame identity
pub struct TransformCoalescer;

impl Coalescer for TransformCoalescer {
    fn split(&self, payload: &[u8]) -> Vec<(String, Value)> {
        let parsed: Value = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("Uncoalescable transform payload: {}", e);
                return Vec::new();
            }
        };
        let transforms = match parsed.get("transforms").and_then(Value::as_array) {
            Some(transforms) => transforms,
            None => return Vec::new(),
        };
        transforms
            .iter()
            .map(|t| {
                let parent = t
                    .pointer("/header/frame_id")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let child = t.get("child_frame_id").and_then(Value::as_str).unwrap_or("");
                (format!("{}:{}", parent, child), t.clone())
            })
            .collect()
    }

    fn assemble(&self, entries: Vec<Value>) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&serde_json::json!({ "transforms": entries }))?)
    }
}

type SinkMap = Arc<RwLock<HashMap<String, Arc<dyn DataChannelSink>>>>;

struct QueuedSubscription {
    sinks: SinkMap,
    pump: JoinHandle<()>,
}

pub(crate) struct QueuedRegistry {
    pool: Arc<WorkerPool>,
    coalescer: Arc<dyn Coalescer>,
    drain_interval: Duration,
    subs: RwLock<HashMap<String, QueuedSubscription>>,
}

impl QueuedRegistry {
    pub fn new(pool: Arc<WorkerPool>, coalescer: Arc<dyn Coalescer>, drain_interval: Duration) -> Self {
        Self {
            pool,
            coalescer,
            drain_interval,
            subs: RwLock::new(HashMap::new()),
        }
    }

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
            .subscribe(WorkerClass::Transform, topic, msg_type, qos)
            .await?;
        let sinks: SinkMap = Arc::new(RwLock::new(HashMap::from([(
            peer_id.to_string(),
            sink,
        )])));
        let pump = tokio::spawn(pump_loop(
            binding,
            Arc::clone(&self.coalescer),
            self.drain_interval,
            Arc::clone(&sinks),
        ));
        subs.insert(topic.to_string(), QueuedSubscription { sinks, pump });
        debug!("Opened queued subscription for {}", topic);
        Ok(())
    }

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
            if let Err(e) = self.pool.unsubscribe(WorkerClass::Transform, topic).await {
                warn!("Failed to release worker binding for {}: {}", topic, e);
            }
            debug!("Closed queued subscription for {}", topic);
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
}

async fn pump_loop(
    mut binding: WorkerBinding,
    coalescer: Arc<dyn Coalescer>,
    drain_interval: Duration,
    sinks: SinkMap,
) {
    let topic = binding.topic().to_string();
    // Insertion-ordered pending set; replacing a key keeps its slot so a
    // frame pair cannot starve under constant updates.
    let mut pending: Vec<(String, Value)> = Vec::new();
    let mut ticker = tokio::time::interval(drain_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = binding.recv() => {
                let payload = match frame {
                    Some(robolink_core::ipc::WorkerFrame::Data { msg: Some(payload), .. }) => payload,
                    Some(frame) if frame.is_close() => break,
                    Some(_) => continue,
                    None => break,
                };
                for (key, value) in coalescer.split(&payload) {
                    match pending.iter().position(|(k, _)| *k == key) {
                        Some(i) => pending[i].1 = value,
                        None if pending.len() < MAX_PENDING_KEYS => pending.push((key, value)),
                        None => trace!("Pending key set full on {}, dropping entry", topic),
                    }
                }
            }
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let entries: Vec<Value> = pending.drain(..).map(|(_, v)| v).collect();
                let payload = match coalescer.assemble(entries) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Coalesce assembly failed on {}: {}", topic, e);
                        continue;
                    }
                };
                for (peer_id, sink) in sinks.read().await.iter() {
                    if !sink.is_open() {
                        continue;
                    }
                    if let Err(e) = sink.send(&payload).await {
                        trace!("Dropping {} for peer {}: {}", topic, peer_id, e);
                    }
                }
            }
        }
    }
    debug!("Queued pump for {} ended", topic);
}
