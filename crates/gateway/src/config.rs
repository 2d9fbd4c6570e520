//! Gateway configuration
//!
//! Loaded from an optional YAML file, overridden by CLI flags and the
//! environment in `bin/gateway.rs`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the cloud signaling relay
    pub signaling_url: String,

    /// Identity this gateway registers under at the relay
    pub robot_id: String,

    /// STUN server URLs for ICE
    pub stun_servers: Vec<String>,

    /// TURN servers for restrictive networks
    pub turn_servers: Vec<TurnServerConfig>,

    /// Directory the file operation downloads into
    pub upload_dir: PathBuf,

    /// Path to the robolink-worker binary; `None` runs workers in-process
    pub worker_bin: Option<PathBuf>,

    /// Negotiation wait budgets
    pub negotiation: NegotiationConfig,

    /// Drain cadence for queued/coalesced subscriptions, milliseconds
    pub queued_drain_ms: u64,

    /// Video encoder settings handed to image workers
    pub encoder: EncoderConfig,
}

/// TURN server credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Bounded waits used by the negotiation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// How long a reconcile waits for the single-flight guard, milliseconds
    pub busy_wait_ms: u64,
    /// Poll interval for guard and state waits, milliseconds
    pub poll_interval_ms: u64,
    /// Wait for the signaling state to reach stable, milliseconds
    pub stable_wait_ms: u64,
    /// Wait for ICE gathering to complete, milliseconds
    pub ice_wait_ms: u64,
    /// How long a pushed offer may sit unanswered before the guard is
    /// reclaimed, milliseconds
    pub answer_wait_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            busy_wait_ms: 10_000,
            poll_interval_ms: 100,
            stable_wait_ms: 10_000,
            ice_wait_ms: 20_000,
            answer_wait_ms: 30_000,
        }
    }
}

impl NegotiationConfig {
    pub fn busy_wait(&self) -> Duration {
        Duration::from_millis(self.busy_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stable_wait(&self) -> Duration {
        Duration::from_millis(self.stable_wait_ms)
    }

    pub fn ice_wait(&self) -> Duration {
        Duration::from_millis(self.ice_wait_ms)
    }

    pub fn answer_wait(&self) -> Duration {
        Duration::from_millis(self.answer_wait_ms)
    }
}

/// Encoder settings forwarded to image workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub bitrate: u32,
    pub framerate: u32,
    pub keyframe_interval: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate: 1_500_000,
            framerate: 15,
            keyframe_interval: 30,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://signaling.robolink.dev/gateway".to_string(),
            robot_id: "robolink".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            upload_dir: PathBuf::from("/tmp/robolink-uploads"),
            worker_bin: None,
            negotiation: NegotiationConfig::default(),
            queued_drain_ms: 50,
            encoder: EncoderConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: GatewayConfig = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field combinations
    pub fn validate(&self) -> Result<()> {
        if self.signaling_url.is_empty() {
            return Err(Error::Config("signaling_url must not be empty".to_string()));
        }
        if self.robot_id.is_empty() {
            return Err(Error::Config("robot_id must not be empty".to_string()));
        }
        if self.negotiation.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be non-zero".to_string()));
        }
        if self.queued_drain_ms == 0 {
            return Err(Error::Config("queued_drain_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}
