//! robolink-gateway: the robot-side gateway process.
//!
//! Connects the robot's bus to remote peers: spawns the worker pool, wires
//! the subscription router and negotiation engine into a session manager,
//! and holds the signaling relay connection until shutdown.

use anyhow::Result;
use clap::Parser;
use robolink_core::bus::{BusConnection, LocalBus};
use robolink_core::directory::{StaticDirectory, TopicDirectory};
use robolink_gateway::negotiation::NegotiationEngine;
use robolink_gateway::session::{SessionManager, WebRtcFactory};
use robolink_gateway::{GatewayConfig, SignalingClient, SubscriptionRouter};
use robolink_workers::encode::VideoEncoderConfig;
use robolink_workers::{
    InProcessLauncher, ProcessLauncher, WorkerLauncher, WorkerPool, WorkerSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "robolink-gateway", about = "robolink robot-side WebRTC gateway")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "ROBOLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the signaling relay URL
    #[arg(long, env = "ROBOLINK_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Override the robot identity
    #[arg(long, env = "ROBOLINK_ROBOT_ID")]
    robot_id: Option<String>,

    /// Run workers inside the gateway process instead of spawning them
    #[arg(long)]
    loopback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(url) = args.signaling_url {
        config.signaling_url = url;
    }
    if let Some(robot_id) = args.robot_id {
        config.robot_id = robot_id;
    }
    config.validate()?;
    info!("Starting gateway as {} via {}", config.robot_id, config.signaling_url);

    // The bus and directory behind these seams are deployment-specific; the
    // in-tree implementations are process-local.
    let bus: Arc<dyn BusConnection> = Arc::new(LocalBus::new());
    let directory: Arc<dyn TopicDirectory> = Arc::new(StaticDirectory::new());

    let settings = WorkerSettings {
        encoder: VideoEncoderConfig {
            bitrate: config.encoder.bitrate,
            framerate: config.encoder.framerate,
            keyframe_interval: config.encoder.keyframe_interval,
        },
    };
    let launcher: Box<dyn WorkerLauncher> = match (&config.worker_bin, args.loopback) {
        (Some(bin), false) => {
            info!("Spawning workers from {}", bin.display());
            Box::new(ProcessLauncher::new(bin.clone()))
        }
        _ => {
            info!("Running workers in-process");
            Box::new(InProcessLauncher::new(Arc::clone(&bus), settings))
        }
    };
    let pool = Arc::new(WorkerPool::new(launcher));

    let router = Arc::new(SubscriptionRouter::new(
        Arc::clone(&pool),
        Arc::clone(&bus),
        Duration::from_millis(config.queued_drain_ms),
    ));
    let engine = Arc::new(NegotiationEngine::new(
        Arc::clone(&router),
        Arc::clone(&directory),
        config.negotiation.clone(),
    ));
    let factory = Arc::new(WebRtcFactory::new(config.clone()));

    let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
    let manager = Arc::new(SessionManager::new(
        engine,
        router,
        factory,
        Arc::clone(&bus),
        Arc::clone(&directory),
        config.upload_dir.clone(),
        outgoing_tx,
    ));

    let retry_loop =
        robolink_gateway::discovery::spawn_retry_loop(Arc::clone(&manager), Arc::clone(&directory));

    let client = SignalingClient::new(config.signaling_url.clone(), config.robot_id.clone(), manager);
    tokio::select! {
        _ = client.run(outgoing_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    retry_loop.abort();
    pool.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}
