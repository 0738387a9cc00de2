//! Signaling relay
//!
//! The two participants never talk directly before the peer link is up. Offers,
//! answers and ICE candidates travel as [`SignalMessage`]s over a per-session
//! [`RelayChannel`]. The wire format is JSON:
//!
//! ```json
//! { "type": "ice-candidate", "sessionId": "lesson-42", "senderId": "t-1",
//!   "payload": { "candidate": "candidate:1 1 udp ...", "sdpMid": "0", "sdpMLineIndex": 0 } }
//! ```

pub mod memory;
#[cfg(feature = "ws-relay")]
pub mod websocket;

pub use memory::InMemoryRelay;
#[cfg(feature = "ws-relay")]
pub use websocket::WebSocketRelay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::{IceCandidate, SessionDescription};
use crate::session::{ParticipantId, SessionId};

/// Relay channel errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Failed to encode signal: {0}")]
    Encode(String),

    #[error("Failed to decode signal: {0}")]
    Decode(String),

    #[error("Failed to publish signal: {0}")]
    Publish(String),

    #[error("Relay connection failed: {0}")]
    Connection(String),

    #[error("Not subscribed to session {0}")]
    NotSubscribed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Typed content of a signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

/// One message on the relay channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub session_id: SessionId,
    pub sender_id: ParticipantId,
    pub payload: serde_json::Value,
}

impl SignalMessage {
    pub fn new(session_id: SessionId, sender_id: ParticipantId, body: &SignalBody) -> Result<Self, RelayError> {
        let (kind, payload) = match body {
            SignalBody::Offer(d) => (SignalKind::Offer, serde_json::to_value(d)),
            SignalBody::Answer(d) => (SignalKind::Answer, serde_json::to_value(d)),
            SignalBody::IceCandidate(c) => (SignalKind::IceCandidate, serde_json::to_value(c)),
        };
        Ok(Self {
            kind,
            session_id,
            sender_id,
            payload: payload.map_err(|e| RelayError::Encode(e.to_string()))?,
        })
    }

    /// Decode the payload according to `type`
    pub fn body(&self) -> Result<SignalBody, RelayError> {
        let decode = |e: serde_json::Error| RelayError::Decode(format!("{:?} payload: {}", self.kind, e));
        Ok(match self.kind {
            SignalKind::Offer => SignalBody::Offer(serde_json::from_value(self.payload.clone()).map_err(decode)?),
            SignalKind::Answer => SignalBody::Answer(serde_json::from_value(self.payload.clone()).map_err(decode)?),
            SignalKind::IceCandidate => {
                SignalBody::IceCandidate(serde_json::from_value(self.payload.clone()).map_err(decode)?)
            }
        })
    }

    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Decode(e.to_string()))
    }
}

type UnsubscribeHook = Box<dyn FnOnce() + Send>;

/// Stream of messages for one session; dropping it unsubscribes
pub struct RelaySubscription {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
    on_drop: Option<UnsubscribeHook>,
}

impl RelaySubscription {
    pub fn new(
        session_id: SessionId,
        rx: mpsc::UnboundedReceiver<SignalMessage>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            session_id,
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next message, or `None` once the relay side is gone
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Publish/subscribe primitives of the external messaging service
#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn publish(&self, message: SignalMessage) -> Result<(), RelayError>;
    async fn subscribe(&self, session_id: &SessionId) -> Result<RelaySubscription, RelayError>;
}
