//! JSON signaling protocol types
//!
//! Every frame on the relay socket is a JSON object. Inbound frames carry
//! `{event, peer, id?, data}`; replies correlate with `{re: id, ...}`;
//! gateway-initiated pushes carry their own `event`.

use crate::negotiation::OfferManifest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound signaling frame
///
/// The `event`/`data` pair is adjacently tagged so each event deserializes
/// straight into its typed parameters; unknown events fail parsing and are
/// dropped by the client with a log line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: SignalEvent,

    /// Relay-assigned peer identity this frame concerns
    #[serde(default)]
    pub peer: Option<String>,

    /// Correlation id when the sender expects a reply
    #[serde(default)]
    pub id: Option<Value>,
}

/// The typed signaling event surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum SignalEvent {
    /// New peer with its initial desired topic sets
    #[serde(rename = "peer")]
    Peer(PeerParams),

    /// Add topics to the peer's read set
    #[serde(rename = "subscribe")]
    Subscribe(SourcesParams),

    /// Remove topics from the peer's read set
    #[serde(rename = "unsubscribe")]
    Unsubscribe(SourcesParams),

    /// Add (topic, type) pairs to the peer's write set
    #[serde(rename = "subscribe:write")]
    SubscribeWrite(WriteSourcesParams),

    /// Remove topics from the peer's write set
    #[serde(rename = "unsubscribe:write")]
    UnsubscribeWrite(SourcesParams),

    /// The peer's SDP answer to an outstanding offer
    #[serde(rename = "sdp:answer")]
    SdpAnswer(SdpParams),

    /// RPC-style bus service call
    #[serde(rename = "service")]
    Service(ServiceParams),

    /// Request the topic name to type map
    #[serde(rename = "introspection")]
    Introspection,

    /// Download a file onto the robot; data is the source URL
    #[serde(rename = "file")]
    File(String),

    /// Peer left; tear down its session
    #[serde(rename = "disconnect")]
    Disconnect,
}

/// Parameters for the `peer` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerParams {
    /// Application-level peer identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_app: Option<String>,

    /// Fallback per-connection identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_instance: Option<String>,

    /// Initial read topic set
    #[serde(default)]
    pub read: Vec<String>,

    /// Initial write set as (topic, type) pairs
    #[serde(default)]
    pub write: Vec<(String, String)>,
}

impl PeerParams {
    /// Application id wins over the per-connection id.
    pub fn identity(&self) -> Option<&str> {
        self.id_app.as_deref().or(self.id_instance.as_deref())
    }
}

/// Parameters for subscribe/unsubscribe events
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourcesParams {
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Parameters for subscribe:write
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WriteSourcesParams {
    #[serde(default)]
    pub sources: Vec<(String, String)>,
}

/// Parameters for sdp:answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdpParams {
    pub sdp: String,
}

/// Parameters for service calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceParams {
    pub service: String,
    #[serde(default)]
    pub msg: Value,
}

/// Outbound signaling frame
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Outgoing {
    /// Register this gateway with the relay
    Register {
        event: &'static str,
        robot_id: String,
    },

    /// Successful reply correlated to an inbound `id`
    Reply { re: Value, data: Value },

    /// Error reply; `err` is the error tag, `msg` the human-readable detail
    ErrorReply { re: Value, err: String, msg: String },

    /// Push a fresh offer to a peer
    PeerUpdate {
        event: &'static str,
        peer: String,
        data: OfferManifest,
    },
}

impl Outgoing {
    pub fn register(robot_id: impl Into<String>) -> Self {
        Outgoing::Register {
            event: "register",
            robot_id: robot_id.into(),
        }
    }

    pub fn reply(re: Value, data: Value) -> Self {
        Outgoing::Reply { re, data }
    }

    pub fn error(re: Value, err: impl Into<String>, msg: impl Into<String>) -> Self {
        Outgoing::ErrorReply {
            re,
            err: err.into(),
            msg: msg.into(),
        }
    }

    pub fn peer_update(peer: impl Into<String>, manifest: OfferManifest) -> Self {
        Outgoing::PeerUpdate {
            event: "peer:update",
            peer: peer.into(),
            data: manifest,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::Error::Signaling(format!("Failed to serialize frame: {}", e)))
    }
}

impl Envelope {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::Error::Signaling(format!("Failed to parse frame: {}", e)))
    }
}
