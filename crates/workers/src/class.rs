//! Worker classes
//!
//! Each class runs as one isolated process with its own bus connection and
//! event loop. The class decides how bus payloads are transformed into
//! output frames and which backpressure discipline the shared output pipe
//! uses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media/data class a worker process is dedicated to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// Pre-encoded video topics, repackaged by NAL unit
    Video,
    /// Raw image topics, decoded and software-encoded
    Image,
    /// Structured data topics, forwarded as-is
    Data,
    /// High-rate coalescable topics (transform trees)
    Transform,
}

impl WorkerClass {
    pub const ALL: [WorkerClass; 4] = [
        WorkerClass::Video,
        WorkerClass::Image,
        WorkerClass::Data,
        WorkerClass::Transform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerClass::Video => "video",
            WorkerClass::Image => "image",
            WorkerClass::Data => "data",
            WorkerClass::Transform => "transform",
        }
    }

    /// Transform workers write best-effort: a full output queue drops the
    /// newest entry at the producer instead of blocking the topic task.
    pub fn drops_when_congested(&self) -> bool {
        matches!(self, WorkerClass::Transform)
    }

    /// Classes whose output frames are media samples
    pub fn is_media(&self) -> bool {
        matches!(self, WorkerClass::Video | WorkerClass::Image)
    }
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(WorkerClass::Video),
            "image" => Ok(WorkerClass::Image),
            "data" => Ok(WorkerClass::Data),
            "transform" => Ok(WorkerClass::Transform),
            other => Err(format!("unknown worker class: {}", other)),
        }
    }
}
