//! robolink-worker: per-class worker process entry point.
//!
//! Spawned by the gateway's `ProcessLauncher` with `--class <class>`.
//! Control commands arrive as JSON lines on stdin; frames leave as
//! length-prefixed bincode on stdout. Logs go to stderr so they cannot
//! corrupt the frame stream.

use anyhow::Result;
use clap::Parser;
use robolink_core::bus::{BusConnection, LocalBus};
use robolink_workers::encode::VideoEncoderConfig;
use robolink_workers::{run_worker, WorkerClass, WorkerSettings};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "robolink-worker", about = "robolink media/data worker process")]
struct Args {
    /// Worker class to run (video, image, data, transform)
    #[arg(long)]
    class: WorkerClass,

    /// Target encoder bitrate in bits per second (image class)
    #[arg(long, env = "ROBOLINK_WORKER_BITRATE", default_value_t = 1_500_000)]
    bitrate: u32,

    /// Encoder framerate hint (image class)
    #[arg(long, env = "ROBOLINK_WORKER_FRAMERATE", default_value_t = 15)]
    framerate: u32,

    /// Frames between forced keyframes (image class)
    #[arg(long, env = "ROBOLINK_WORKER_KEYFRAME_INTERVAL", default_value_t = 30)]
    keyframe_interval: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = WorkerSettings {
        encoder: VideoEncoderConfig {
            bitrate: args.bitrate,
            framerate: args.framerate,
            keyframe_interval: args.keyframe_interval,
        },
    };

    // The bus connection behind this seam is deployment-specific; the
    // in-tree implementation is the process-local bus.
    let bus: Arc<dyn BusConnection> = Arc::new(LocalBus::new());

    run_worker(
        args.class,
        bus,
        tokio::io::stdin(),
        tokio::io::stdout(),
        settings,
    )
    .await?;
    Ok(())
}
