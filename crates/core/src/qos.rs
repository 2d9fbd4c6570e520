//! Delivery-policy (QoS) model for bus subscriptions
//!
//! Mirrors the bus-side quality-of-service vocabulary: history depth,
//! reliability, durability and an optional per-message lifespan. Workers
//! receive the profile verbatim in their subscribe commands.

use serde::{Deserialize, Serialize};

/// History policy: how many messages the bus buffers per subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum History {
    /// Keep only the most recent `n` messages
    KeepLast(usize),
    /// Keep every message (subject to resource limits)
    KeepAll,
}

/// Reliability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    /// Retransmit until acknowledged
    Reliable,
    /// Fire and forget
    BestEffort,
}

/// Durability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// No replay for late joiners
    Volatile,
    /// Replay the last message to late joiners (latched topic)
    TransientLocal,
}

/// Delivery policy attached to a topic subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosProfile {
    pub history: History,
    pub reliability: Reliability,
    pub durability: Durability,
    /// Maximum age of a message before the bus discards it, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifespan_ms: Option<u64>,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            history: History::KeepLast(1),
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            lifespan_ms: None,
        }
    }
}

impl QosProfile {
    /// Profile for high-rate sensor streams: newest-only, best effort
    pub fn sensor() -> Self {
        Self {
            history: History::KeepLast(1),
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            lifespan_ms: None,
        }
    }

    /// Profile for latched state topics: replay last value to late joiners
    pub fn latched() -> Self {
        Self {
            history: History::KeepLast(1),
            reliability: Reliability::Reliable,
            durability: Durability::TransientLocal,
            lifespan_ms: None,
        }
    }

    /// History depth (1 for `KeepAll`, which delegates buffering to the bus)
    pub fn depth(&self) -> usize {
        match self.history {
            History::KeepLast(n) => n.max(1),
            History::KeepAll => 1,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }
}
