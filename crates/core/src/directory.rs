//! Topic discovery interface
//!
//! The discovery service supplies topic name → message type mappings and a
//! change notification. A topic missing from the directory is not an error:
//! consumers queue the topic as "not yet discovered" and re-query when the
//! generation counter moves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// What the directory knows about one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    /// Bus-level message type (e.g. `sensor_msgs/Image`)
    pub msg_type: String,
}

impl TopicInfo {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
        }
    }
}

/// Read access to the topic/type directory
#[async_trait]
pub trait TopicDirectory: Send + Sync {
    /// Look up a single topic
    async fn get(&self, topic: &str) -> Option<TopicInfo>;

    /// Snapshot of every known topic
    async fn list(&self) -> Vec<(String, TopicInfo)>;

    /// Change notification: the watched value is a generation counter that
    /// increments whenever the directory contents change. Consumers re-query
    /// after observing a change rather than diffing event payloads.
    fn watch(&self) -> watch::Receiver<u64>;
}

/// In-memory directory
///
/// Used by the loopback deployment mode and by tests; a real deployment
/// plugs in the middleware's own graph introspection behind the same trait.
pub struct StaticDirectory {
    topics: RwLock<BTreeMap<String, TopicInfo>>,
    generation: watch::Sender<u64>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            topics: RwLock::new(BTreeMap::new()),
            generation,
        }
    }

    /// Add or update a topic and notify watchers
    pub async fn insert(&self, topic: impl Into<String>, info: TopicInfo) {
        let topic = topic.into();
        debug!("Directory: {} -> {}", topic, info.msg_type);
        self.topics.write().await.insert(topic, info);
        self.generation.send_modify(|g| *g += 1);
    }

    /// Remove a topic and notify watchers
    pub async fn remove(&self, topic: &str) -> Option<TopicInfo> {
        let removed = self.topics.write().await.remove(topic);
        if removed.is_some() {
            self.generation.send_modify(|g| *g += 1);
        }
        removed
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicDirectory for StaticDirectory {
    async fn get(&self, topic: &str) -> Option<TopicInfo> {
        self.topics.read().await.get(topic).cloned()
    }

    async fn list(&self) -> Vec<(String, TopicInfo)> {
        self.topics
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn watch(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_and_miss() {
        let dir = StaticDirectory::new();
        dir.insert("/imu", TopicInfo::new("sensor_msgs/Imu")).await;

        assert_eq!(
            dir.get("/imu").await,
            Some(TopicInfo::new("sensor_msgs/Imu"))
        );
        assert_eq!(dir.get("/camera").await, None);
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let dir = StaticDirectory::new();
        let mut rx = dir.watch();
        let before = *rx.borrow();

        dir.insert("/camera", TopicInfo::new("sensor_msgs/Image"))
            .await;

        rx.changed().await.unwrap();
        assert!(*rx.borrow() > before);
        assert_eq!(dir.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_bumps_generation() {
        let dir = StaticDirectory::new();
        dir.insert("/t", TopicInfo::new("std_msgs/Empty")).await;
        let rx = dir.watch();
        let before = *rx.borrow();

        assert!(dir.remove("/t").await.is_some());
        assert!(*dir.watch().borrow() > before);
        assert!(dir.remove("/t").await.is_none());
    }
}
