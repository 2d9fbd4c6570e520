//! robolink core - shared abstractions for the bus-to-WebRTC gateway
//!
//! This crate holds everything the gateway process and the worker processes
//! agree on without depending on each other:
//!
//! - `bus`: the message-bus connection trait plus the in-process `LocalBus`
//! - `qos`: the delivery-policy vocabulary attached to subscriptions
//! - `directory`: topic name → type discovery with change notification
//! - `ipc`: the control-command / output-frame protocol spoken over worker
//!   pipes (JSON lines inbound, length-prefixed bincode outbound)
//! - `media`: bus-side image and encoded-video payload formats
//!
//! It has no dependency on the `webrtc` stack; transport concerns live in
//! `robolink-gateway`.

pub mod bus;
pub mod directory;
pub mod error;
pub mod ipc;
pub mod media;
pub mod qos;

pub use error::{Error, Result};
