//! WebSocket signaling client
//!
//! Maintains the connection to the cloud relay, feeds inbound frames to the
//! session manager, and writes the manager's outbound frames back. A dropped
//! connection tears down every peer session and reconnects with exponential
//! backoff; the relay re-announces peers after reconnect, so sessions
//! re-synchronize from scratch.

use crate::session::SessionManager;
use crate::signaling::protocol::{Envelope, Outgoing};
use crate::Result;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct SignalingClient {
    url: String,
    robot_id: String,
    manager: Arc<SessionManager>,
}

enum SessionEnd {
    /// Socket closed or errored; reconnect
    Reconnect,
    /// The outbound channel is gone; the gateway is shutting down
    Shutdown,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>, robot_id: impl Into<String>, manager: Arc<SessionManager>) -> Self {
        Self {
            url: url.into(),
            robot_id: robot_id.into(),
            manager,
        }
    }

    /// Run until the outbound channel closes. Reconnects forever.
    pub async fn run(&self, mut outgoing: mpsc::Receiver<Outgoing>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.session(&mut outgoing).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Signaling client stopped");
                    return;
                }
                Ok(SessionEnd::Reconnect) => {
                    warn!("Signaling connection closed");
                }
                Err(e) => {
                    warn!("Signaling connection failed: {}", e);
                }
            }
            // Peers cannot reach us without signaling; drop them so the
            // relay's re-announcements rebuild clean sessions.
            self.manager.teardown_all().await;

            debug!("Reconnecting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn session(&self, outgoing: &mut mpsc::Receiver<Outgoing>) -> Result<SessionEnd> {
        info!("Connecting to signaling relay: {}", self.url);
        let (ws_stream, _) = connect_async(&self.url).await?;
        info!("Connected to signaling relay");

        let (mut write, mut read) = ws_stream.split();
        let register = Outgoing::register(self.robot_id.clone()).to_json()?;
        write.send(Message::Text(register)).await?;

        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        let json = frame.to_json()?;
                        debug!("Sending signaling frame: {}", json);
                        write.send(Message::Text(json)).await?;
                    }
                    None => return Ok(SessionEnd::Shutdown),
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                        Ok(env) => self.manager.handle_event(env).await,
                        Err(e) => warn!("Dropping unparseable frame: {}", e),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Reconnect),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}
