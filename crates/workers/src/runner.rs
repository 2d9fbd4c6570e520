//! Worker process runtime
//!
//! One worker process serves one class. It reads `WorkerCommand` JSON lines
//! from its control channel, owns a local bus connection, and runs a
//! dedicated task per active topic subscription so a slow transform on one
//! topic cannot starve bus callback delivery for another. All topic tasks
//! write into one shared output pipe through a bounded channel owned by a
//! single writer task; awaiting the channel send is what throttles a
//! topic's handling path when the consumer is slow.

use crate::class::WorkerClass;
use crate::encode::{packetize_annex_b, VideoEncoder, VideoEncoderConfig};
use crate::Result;
use robolink_core::bus::{BusConnection, BusMessage};
use robolink_core::ipc::{
    read_command, write_frame, WorkerCommand, WorkerFrame,
};
use robolink_core::media::{nal_is_idr, EncodedVideo, RawImage};
use robolink_core::qos::QosProfile;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Depth of the shared output queue in front of the pipe writer
const OUTPUT_QUEUE_DEPTH: usize = 4;

/// Tunables for a worker process
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    pub encoder: VideoEncoderConfig,
}

struct TopicTask {
    handle: JoinHandle<()>,
}

/// Run a worker loop for `class` over the given control/output streams.
///
/// Returns when the control channel reaches EOF or a `Shutdown` command
/// arrives. Used both by the `robolink-worker` binary (stdin/stdout) and by
/// the in-process launcher (duplex streams).
pub async fn run_worker<R, W>(
    class: WorkerClass,
    bus: Arc<dyn BusConnection>,
    control: R,
    output: W,
    settings: WorkerSettings,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!("Worker starting: class={}", class);

    let (out_tx, mut out_rx) = mpsc::channel::<WorkerFrame>(OUTPUT_QUEUE_DEPTH);

    // Single writer task owns the output pipe.
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut output, &frame).await {
                warn!("Worker output pipe write failed, stopping writer: {}", e);
                break;
            }
        }
    });

    let mut active: HashMap<String, TopicTask> = HashMap::new();
    let mut reader = BufReader::new(control);

    loop {
        let cmd = match read_command(&mut reader).await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                info!("Worker {}: control channel closed", class);
                break;
            }
            Err(e) => {
                warn!("Worker {}: bad control command: {}", class, e);
                continue;
            }
        };

        match cmd {
            WorkerCommand::Subscribe {
                topic,
                msg_type,
                qos,
            } => {
                if active.contains_key(&topic) {
                    debug!("Worker {}: already subscribed to {}", class, topic);
                    continue;
                }
                info!("Worker {}: subscribe {} ({})", class, topic, msg_type);
                let handle = tokio::spawn(topic_loop(
                    class,
                    topic.clone(),
                    msg_type,
                    qos,
                    Arc::clone(&bus),
                    out_tx.clone(),
                    settings.clone(),
                ));
                active.insert(topic, TopicTask { handle });
            }
            WorkerCommand::Unsubscribe { topic } => {
                match active.remove(&topic) {
                    Some(task) => {
                        info!("Worker {}: unsubscribe {}", class, topic);
                        // Cancels any in-flight push for the topic.
                        task.handle.abort();
                        let _ = out_tx.send(WorkerFrame::closed(&topic)).await;
                    }
                    None => debug!("Worker {}: unsubscribe for unknown topic {}", class, topic),
                }
            }
            WorkerCommand::Shutdown => {
                info!("Worker {}: shutdown requested", class);
                break;
            }
        }
    }

    for (topic, task) in active.drain() {
        task.handle.abort();
        let _ = out_tx.send(WorkerFrame::closed(&topic)).await;
    }
    drop(out_tx);
    let _ = writer.await;

    info!("Worker stopped: class={}", class);
    Ok(())
}

/// Per-topic subscription loop
async fn topic_loop(
    class: WorkerClass,
    topic: String,
    msg_type: String,
    qos: QosProfile,
    bus: Arc<dyn BusConnection>,
    out_tx: mpsc::Sender<WorkerFrame>,
    settings: WorkerSettings,
) {
    let mut sub = match bus.subscribe(&topic, &msg_type, &qos).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Worker {}: bus subscribe failed for {}: {}", class, topic, e);
            let _ = out_tx.send(WorkerFrame::closed(&topic)).await;
            return;
        }
    };

    let mut transform = TopicTransform::new(class, settings);
    // A topic that produced a malformed or unsupported message is ignored
    // for the life of the subscription: logged once, never retried.
    let mut ignored = false;

    while let Some(msg) = sub.recv().await {
        if ignored {
            continue;
        }
        match transform.apply(&topic, msg) {
            Ok(Some(frame)) => {
                if class.drops_when_congested() {
                    if let Err(mpsc::error::TrySendError::Full(_)) = out_tx.try_send(frame) {
                        trace!("Worker {}: output queue full, dropping newest on {}", class, topic);
                    }
                } else if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "Worker {}: marking topic {} ignored: {}",
                    class, topic, e
                );
                ignored = true;
            }
        }
    }

    debug!("Worker {}: topic loop ended for {}", class, topic);
    let _ = out_tx.send(WorkerFrame::closed(&topic)).await;
}

/// Per-topic stateful message transform
struct TopicTransform {
    class: WorkerClass,
    encoder: Option<VideoEncoder>,
    settings: WorkerSettings,
    /// Timestamp origin for monotonic media presentation times
    ts_origin_us: Option<u64>,
}

impl TopicTransform {
    fn new(class: WorkerClass, settings: WorkerSettings) -> Self {
        Self {
            class,
            encoder: None,
            settings,
            ts_origin_us: None,
        }
    }

    fn pts(&mut self, recv_ts_us: u64) -> u64 {
        let origin = *self.ts_origin_us.get_or_insert(recv_ts_us);
        recv_ts_us.saturating_sub(origin)
    }

    fn apply(&mut self, topic: &str, msg: BusMessage) -> crate::Result<Option<WorkerFrame>> {
        match self.class {
            WorkerClass::Data | WorkerClass::Transform => Ok(Some(WorkerFrame::Data {
                topic: topic.to_string(),
                msg: Some(msg.payload),
            })),
            WorkerClass::Video => {
                let video = EncodedVideo::decode(&msg.payload)?;
                if video.format != "h264" {
                    return Err(crate::Error::Encoding(format!(
                        "unsupported video format '{}'",
                        video.format
                    )));
                }
                let packets = packetize_annex_b(&video.data);
                if packets.is_empty() {
                    return Ok(None);
                }
                let keyframe = video.keyframe || packets.iter().any(|p| nal_is_idr(&p.data));
                let pts_us = self.pts(msg.recv_ts_us);
                Ok(Some(WorkerFrame::Media {
                    topic: topic.to_string(),
                    packets,
                    pts_us,
                    keyframe,
                }))
            }
            WorkerClass::Image => {
                let image = RawImage::decode(&msg.payload)?;
                let i420 = image.to_i420()?;
                let encoder = match &mut self.encoder {
                    Some(enc) => enc,
                    slot @ None => slot.insert(VideoEncoder::new(self.settings.encoder.clone())?),
                };
                let au = encoder.encode(&i420)?;
                let pts_us = self.pts(msg.recv_ts_us);
                Ok(Some(WorkerFrame::Media {
                    topic: topic.to_string(),
                    packets: au.packets,
                    pts_us,
                    keyframe: au.keyframe,
                }))
            }
        }
    }
}
