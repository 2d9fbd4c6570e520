//! Worker process pool
//!
//! The gateway side of the worker contract. One worker process per class,
//! started lazily on first use. Each worker gets a control writer task and a
//! demux task that reads topic-tagged frames off the worker's output pipe
//! and routes them to per-topic bindings. A topic has at most one binding
//! per pool; sharing across consumers happens above this layer.

use crate::class::WorkerClass;
use crate::runner::{run_worker, WorkerSettings};
use crate::{Error, Result};
use async_trait::async_trait;
use robolink_core::bus::BusConnection;
use robolink_core::ipc::{read_frame, write_command, WorkerCommand, WorkerFrame};
use robolink_core::qos::QosProfile;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

/// Per-topic binding queue depth for classes that block when congested
const BINDING_QUEUE_DEPTH: usize = 1;
/// Per-topic binding queue depth for the transform class (drop-newest)
const TRANSFORM_QUEUE_DEPTH: usize = 16;

/// I/O handles for a launched worker
pub struct WorkerIo {
    pub control: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Kept alive for the duration of the worker; `None` for in-process workers
    pub child: Option<tokio::process::Child>,
}

/// Strategy for bringing up a worker for a class
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, class: WorkerClass) -> Result<WorkerIo>;
}

/// Launches `robolink-worker` as a child process with piped stdin/stdout
pub struct ProcessLauncher {
    worker_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, class: WorkerClass) -> Result<WorkerIo> {
        let mut child = Command::new(&self.worker_bin)
            .arg("--class")
            .arg(class.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.worker_bin.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("worker stdout not captured".into()))?;

        info!(
            "Spawned {} worker: pid={:?}",
            class,
            child.id()
        );
        Ok(WorkerIo {
            control: Box::new(stdin),
            output: Box::new(stdout),
            child: Some(child),
        })
    }
}

/// Runs the worker loop as an in-process task over duplex pipes.
///
/// Keeps the full control/output framing in play without a child process,
/// which is what loopback mode and the tests want.
pub struct InProcessLauncher {
    bus: Arc<dyn BusConnection>,
    settings: WorkerSettings,
}

impl InProcessLauncher {
    pub fn new(bus: Arc<dyn BusConnection>, settings: WorkerSettings) -> Self {
        Self { bus, settings }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, class: WorkerClass) -> Result<WorkerIo> {
        let (control_tx, control_rx) = tokio::io::duplex(16 * 1024);
        let (output_tx, output_rx) = tokio::io::duplex(256 * 1024);
        let bus = Arc::clone(&self.bus);
        let settings = self.settings.clone();
        tokio::spawn(async move {
            if let Err(e) = run_worker(class, bus, control_rx, output_tx, settings).await {
                warn!("In-process {} worker failed: {}", class, e);
            }
        });
        Ok(WorkerIo {
            control: Box::new(control_tx),
            output: Box::new(output_rx),
            child: None,
        })
    }
}

type TopicSenders = Arc<Mutex<HashMap<String, mpsc::Sender<WorkerFrame>>>>;

struct WorkerEntry {
    control_tx: mpsc::Sender<WorkerCommand>,
    topics: TopicSenders,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

/// Receiving half of one topic's worker subscription.
///
/// `recv` returns `None` once the binding is released; a close sentinel
/// frame before that means the worker side ended the subscription.
#[derive(Debug)]
pub struct WorkerBinding {
    class: WorkerClass,
    topic: String,
    rx: mpsc::Receiver<WorkerFrame>,
}

impl WorkerBinding {
    pub async fn recv(&mut self) -> Option<WorkerFrame> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn class(&self) -> WorkerClass {
        self.class
    }
}

/// Lazily-started pool of class workers
pub struct WorkerPool {
    launcher: Box<dyn WorkerLauncher>,
    workers: Mutex<HashMap<WorkerClass, WorkerEntry>>,
}

impl WorkerPool {
    pub fn new(launcher: Box<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `topic` to the worker for `class`, starting the worker if needed.
    ///
    /// At most one binding may exist per topic; a second call without an
    /// intervening `unsubscribe` returns `AlreadyBound`.
    pub async fn subscribe(
        &self,
        class: WorkerClass,
        topic: &str,
        msg_type: &str,
        qos: &QosProfile,
    ) -> Result<WorkerBinding> {
        let mut workers = self.workers.lock().await;

        // A dead worker's entry is discarded so the next subscription gets a
        // fresh process. Its old bindings were already closed by the demux.
        if let Some(entry) = workers.get(&class) {
            if !entry.alive.load(Ordering::SeqCst) {
                info!("Discarding dead {} worker entry", class);
                workers.remove(&class);
            }
        }

        if !workers.contains_key(&class) {
            let entry = self.start_worker(class).await?;
            workers.insert(class, entry);
        }
        let entry = workers
            .get(&class)
            .ok_or_else(|| Error::WorkerDead(class.to_string()))?;

        let depth = if class.drops_when_congested() {
            TRANSFORM_QUEUE_DEPTH
        } else {
            BINDING_QUEUE_DEPTH
        };
        let (tx, rx) = mpsc::channel(depth);
        {
            let mut topics = entry.topics.lock().await;
            // A slot whose receiver is gone is free; only a live binding
            // blocks rebinding.
            if let Some(existing) = topics.get(topic) {
                if !existing.is_closed() {
                    return Err(Error::AlreadyBound(topic.to_string()));
                }
            }
            topics.insert(topic.to_string(), tx);
        }

        entry
            .control_tx
            .send(WorkerCommand::Subscribe {
                topic: topic.to_string(),
                msg_type: msg_type.to_string(),
                qos: qos.clone(),
            })
            .await
            .map_err(|_| Error::WorkerDead(class.to_string()))?;

        debug!("Bound topic {} to {} worker", topic, class);
        Ok(WorkerBinding {
            class,
            topic: topic.to_string(),
            rx,
        })
    }

    /// Ask the worker to drop `topic` and release its binding slot. The
    /// binding's receive stream ends immediately; the worker's own close
    /// sentinel for the old subscription is discarded on arrival.
    pub async fn unsubscribe(&self, class: WorkerClass, topic: &str) -> Result<()> {
        let workers = self.workers.lock().await;
        if let Some(entry) = workers.get(&class) {
            entry.topics.lock().await.remove(topic);
            entry
                .control_tx
                .send(WorkerCommand::Unsubscribe {
                    topic: topic.to_string(),
                })
                .await
                .map_err(|_| Error::WorkerDead(class.to_string()))?;
        }
        Ok(())
    }

    /// Request shutdown of every running worker. Workers that do not drain
    /// within the grace period get a SIGTERM; `kill_on_drop` is the backstop.
    pub async fn shutdown(&self) {
        let workers = self.workers.lock().await;
        for (class, entry) in workers.iter() {
            if entry.control_tx.send(WorkerCommand::Shutdown).await.is_err() {
                debug!("{} worker already gone at shutdown", class);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        #[cfg(unix)]
        for entry in workers.values() {
            if let (Some(pid), true) = (entry.pid, entry.alive.load(Ordering::SeqCst)) {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
    }

    async fn start_worker(&self, class: WorkerClass) -> Result<WorkerEntry> {
        let io = self.launcher.launch(class).await?;
        let pid = io.child.as_ref().and_then(|c| c.id());
        let topics: TopicSenders = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let (control_tx, mut control_rx) = mpsc::channel::<WorkerCommand>(32);
        let mut control = io.control;
        tokio::spawn(async move {
            while let Some(cmd) = control_rx.recv().await {
                if let Err(e) = write_command(&mut control, &cmd).await {
                    warn!("Worker control write failed: {}", e);
                    break;
                }
            }
        });

        let demux_topics = Arc::clone(&topics);
        let demux_alive = Arc::clone(&alive);
        let mut output = io.output;
        let child = io.child;
        tokio::spawn(async move {
            // Holding the child here ties its lifetime to the demux task.
            let _child = child;
            loop {
                let frame = match read_frame::<_, WorkerFrame>(&mut output).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        info!("{} worker output pipe closed", class);
                        break;
                    }
                    Err(e) => {
                        warn!("{} worker output pipe error: {}", class, e);
                        break;
                    }
                };
                let topic = frame.topic().to_string();
                let close = frame.is_close();
                let sender = demux_topics.lock().await.get(&topic).cloned();
                match sender {
                    Some(tx) => {
                        if class.drops_when_congested() {
                            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
                                trace!("Binding for {} congested, dropping newest", topic);
                            }
                        } else if tx.send(frame).await.is_err() {
                            debug!("Binding for {} dropped, discarding frames", topic);
                            demux_topics.lock().await.remove(&topic);
                        }
                    }
                    None => trace!("Frame for unbound topic {}", topic),
                }
                if close {
                    demux_topics.lock().await.remove(&topic);
                }
            }

            demux_alive.store(false, Ordering::SeqCst);
            let orphaned: Vec<_> = demux_topics.lock().await.drain().collect();
            for (topic, tx) in orphaned {
                let _ = tx.send(WorkerFrame::closed(&topic)).await;
            }
        });

        Ok(WorkerEntry {
            control_tx,
            topics,
            alive,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_core::bus::LocalBus;

    fn pool_with_local_bus() -> (WorkerPool, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        let launcher = InProcessLauncher::new(
            Arc::clone(&bus) as Arc<dyn BusConnection>,
            WorkerSettings::default(),
        );
        (WorkerPool::new(Box::new(launcher)), bus)
    }

    #[tokio::test]
    async fn test_binding_receives_bus_traffic() {
        let (pool, bus) = pool_with_local_bus();
        let mut binding = pool
            .subscribe(WorkerClass::Data, "/odom", "nav_msgs/Odometry", &QosProfile::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let publisher = bus
            .advertise("/odom", "nav_msgs/Odometry", &QosProfile::default())
            .await
            .unwrap();
        publisher.publish(vec![1, 2, 3]).unwrap();

        let frame = binding.recv().await.unwrap();
        assert_eq!(
            frame,
            WorkerFrame::Data {
                topic: "/odom".into(),
                msg: Some(vec![1, 2, 3])
            }
        );
    }

    #[tokio::test]
    async fn test_second_binding_rejected() {
        let (pool, _bus) = pool_with_local_bus();
        let _binding = pool
            .subscribe(WorkerClass::Data, "/odom", "nav_msgs/Odometry", &QosProfile::default())
            .await
            .unwrap();
        let err = pool
            .subscribe(WorkerClass::Data, "/odom", "nav_msgs/Odometry", &QosProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyBound(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_allows_rebinding() {
        let (pool, _bus) = pool_with_local_bus();
        let mut binding = pool
            .subscribe(WorkerClass::Data, "/odom", "nav_msgs/Odometry", &QosProfile::default())
            .await
            .unwrap();

        pool.unsubscribe(WorkerClass::Data, "/odom").await.unwrap();
        assert!(binding.recv().await.is_none());

        // The sentinel released the slot; a fresh binding must succeed.
        let again = pool
            .subscribe(WorkerClass::Data, "/odom", "nav_msgs/Odometry", &QosProfile::default())
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_classes_get_separate_workers() {
        let (pool, bus) = pool_with_local_bus();
        let mut data = pool
            .subscribe(WorkerClass::Data, "/imu", "sensor_msgs/Imu", &QosProfile::sensor())
            .await
            .unwrap();
        let mut transform = pool
            .subscribe(WorkerClass::Transform, "/tf", "tf2_msgs/TFMessage", &QosProfile::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let imu = bus
            .advertise("/imu", "sensor_msgs/Imu", &QosProfile::sensor())
            .await
            .unwrap();
        let tf = bus
            .advertise("/tf", "tf2_msgs/TFMessage", &QosProfile::default())
            .await
            .unwrap();
        imu.publish(vec![1]).unwrap();
        tf.publish(vec![2]).unwrap();

        assert_eq!(data.recv().await.unwrap().topic(), "/imu");
        assert_eq!(transform.recv().await.unwrap().topic(), "/tf");
    }
}
