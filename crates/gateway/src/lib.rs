//! Robot WebRTC gateway
//!
//! Exposes the robot's internal publish/subscribe bus to remote peers over
//! peer-to-peer data channels and media tracks, coordinated through a cloud
//! signaling relay. The crate is organized bottom-up:
//!
//! - [`router`]: one upstream worker subscription per topic, fanned out to
//!   any number of peer sinks with reference counting and backpressure
//! - [`peer`]: per-peer session state and the transport seam
//! - [`negotiation`]: the offer/answer/ICE state machine, serialized per peer
//! - [`session`]: the registry and the signaling event dispatch
//! - [`signaling`]: the relay socket and wire protocol
//! - [`discovery`]: renegotiation of peers waiting on undiscovered topics

pub mod config;
pub mod discovery;
pub mod error;
pub mod negotiation;
pub mod ops;
pub mod peer;
pub mod router;
pub mod session;
pub mod signaling;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use negotiation::{NegotiationEngine, OfferManifest};
pub use router::SubscriptionRouter;
pub use session::{SessionManager, SessionRegistry, TransportFactory, WebRtcFactory};
pub use signaling::SignalingClient;
