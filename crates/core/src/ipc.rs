//! Worker IPC frame protocol
//!
//! Control commands travel gateway → worker as JSON lines on the worker's
//! stdin; frames travel worker → gateway as length-prefixed bincode on the
//! worker's stdout. Pipes are ordered and reliable until closed, and their
//! finite buffer provides the backpressure that throttles a worker's
//! per-topic handling path without a separate credit protocol.

use crate::qos::QosProfile;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest frame a worker may emit (covers a full camera frame with headroom)
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Command sent to a worker over its control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Attach a local bus subscription for `topic`
    Subscribe {
        topic: String,
        msg_type: String,
        qos: QosProfile,
    },
    /// Stop the subscription and emit the close sentinel for `topic`
    Unsubscribe { topic: String },
    /// Drain and exit
    Shutdown,
}

/// One packetized media sample fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPacket {
    /// Packet payload (e.g. one NAL unit)
    pub data: Vec<u8>,
    /// Set on the last packet of an access unit
    pub marker: bool,
}

/// One frame emitted by a worker on its output pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerFrame {
    /// Structured data for piped/queued subscriptions.
    ///
    /// `msg: None` is the close sentinel: the worker-side subscription has
    /// ended and the consumer can distinguish that from "no data yet".
    Data {
        topic: String,
        msg: Option<Vec<u8>>,
    },
    /// Transcoded media for one topic
    Media {
        topic: String,
        packets: Vec<MediaPacket>,
        /// Presentation timestamp, microseconds, worker-monotonic
        pts_us: u64,
        keyframe: bool,
    },
}

impl WorkerFrame {
    /// Close sentinel for `topic`
    pub fn closed(topic: impl Into<String>) -> Self {
        WorkerFrame::Data {
            topic: topic.into(),
            msg: None,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            WorkerFrame::Data { topic, .. } => topic,
            WorkerFrame::Media { topic, .. } => topic,
        }
    }

    /// True for the `Data { msg: None }` sentinel
    pub fn is_close(&self) -> bool {
        matches!(self, WorkerFrame::Data { msg: None, .. })
    }
}

/// Write one length-prefixed bincode frame
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame; `None` on clean EOF
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// Write one control command as a JSON line
pub async fn write_command<W>(writer: &mut W, cmd: &WorkerCommand) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(cmd)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next control command; `None` on EOF
pub async fn read_command<R>(reader: &mut BufReader<R>) -> Result<Option<WorkerCommand>>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}
