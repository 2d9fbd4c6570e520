//! Discovery-driven renegotiation
//!
//! Watches the directory's generation counter; whenever the directory
//! changes, peers holding topics that were not discoverable at their last
//! reconcile are renegotiated. A miss stays queued until the directory
//! learns the type, however long that takes.

use crate::session::SessionManager;
use robolink_core::directory::TopicDirectory;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the retry loop. Exits when the directory's watch channel closes.
pub fn spawn_retry_loop(
    manager: Arc<SessionManager>,
    directory: Arc<dyn TopicDirectory>,
) -> JoinHandle<()> {
    // Subscribed before the task runs, so a generation bump between spawn
    // and the first poll is still observed.
    let mut generation = directory.watch();
    tokio::spawn(async move {
        retry_pending(&manager, directory.as_ref()).await;
        while generation.changed().await.is_ok() {
            let current = *generation.borrow_and_update();
            debug!("Directory generation {}", current);
            retry_pending(&manager, directory.as_ref()).await;
        }
        debug!("Directory watch closed, retry loop exiting");
    })
}

/// Renegotiate every peer whose pending set now has a discoverable topic.
async fn retry_pending(manager: &SessionManager, directory: &dyn TopicDirectory) {
    for peer in manager.registry().all().await {
        let pending: Vec<String> = peer.pending_topics.read().await.iter().cloned().collect();
        if pending.is_empty() {
            continue;
        }
        let mut resolvable = false;
        for topic in &pending {
            if directory.get(topic).await.is_some() {
                resolvable = true;
                break;
            }
        }
        if resolvable {
            info!("Pending topics for peer {} are now discoverable", peer.id);
            manager.push_reconcile(Arc::clone(&peer)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, NegotiationConfig};
    use crate::negotiation::NegotiationEngine;
    use crate::peer::Peer;
    use crate::router::SubscriptionRouter;
    use crate::session::WebRtcFactory;
    use crate::signaling::Outgoing;
    use robolink_core::bus::{BusConnection, LocalBus};
    use robolink_core::directory::{StaticDirectory, TopicInfo};
    use robolink_workers::{InProcessLauncher, WorkerPool, WorkerSettings};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn pending_peer_fixture() -> (
        Arc<SessionManager>,
        Arc<StaticDirectory>,
        Arc<Peer>,
        mpsc::Receiver<Outgoing>,
    ) {
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
        let (tx, rx) = mpsc::channel(16);
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&engine),
            router,
            Arc::new(WebRtcFactory::new(GatewayConfig::default())),
            bus as Arc<dyn BusConnection>,
            Arc::clone(&directory) as Arc<dyn TopicDirectory>,
            std::env::temp_dir(),
            tx,
        ));

        // Peer wants /imu before discovery knows it.
        let transport = Arc::new(crate::peer::mock::MockTransport::new());
        let peer = Arc::new(Peer::new("alice", transport));
        peer.read_subs.write().await.insert("/imu".to_string());
        manager.registry().insert(Arc::clone(&peer)).await;
        manager.push_reconcile(Arc::clone(&peer)).await;
        assert!(peer.pending_topics.read().await.contains("/imu"));
        (manager, directory, peer, rx)
    }

    async fn expect_imu_offer(rx: &mut mpsc::Receiver<Outgoing>) {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no offer pushed")
            .unwrap();
        match frame {
            Outgoing::PeerUpdate { peer: peer_id, data, .. } => {
                assert_eq!(peer_id, "alice");
                assert_eq!(data.read_channels.len(), 1);
                assert_eq!(data.read_channels[0].topic, "/imu");
            }
            other => panic!("expected peer:update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_discovery_triggers_offer_for_pending_peer() {
        let (manager, directory, peer, mut rx) = pending_peer_fixture().await;

        let retry = spawn_retry_loop(
            Arc::clone(&manager),
            Arc::clone(&directory) as Arc<dyn TopicDirectory>,
        );

        // Inserted right after spawn, before the task's first poll. The
        // receiver was subscribed before the spawn, so the change must not
        // be lost.
        directory.insert("/imu", TopicInfo::new("sensor_msgs/Imu")).await;

        expect_imu_offer(&mut rx).await;
        assert!(peer.pending_topics.read().await.is_empty());
        retry.abort();
    }

    #[tokio::test]
    async fn test_change_before_loop_start_still_renegotiates() {
        let (manager, directory, peer, mut rx) = pending_peer_fixture().await;

        directory.insert("/imu", TopicInfo::new("sensor_msgs/Imu")).await;
        let retry = spawn_retry_loop(
            Arc::clone(&manager),
            Arc::clone(&directory) as Arc<dyn TopicDirectory>,
        );

        expect_imu_offer(&mut rx).await;
        assert!(peer.pending_topics.read().await.is_empty());
        retry.abort();
    }
}
