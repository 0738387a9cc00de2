//! Peer transport abstraction
//!
//! The orchestrator drives negotiation through [`PeerTransport`], the
//! capability a platform peer connection offers: descriptions, candidates,
//! streams and statistics. [`loopback::LoopbackNetwork`] provides an in-memory
//! implementation where two transports connect to each other inside one process.

pub mod link;
pub mod loopback;

pub use link::{CandidateBuffer, ConnectionState, InvalidTransition, LinkEvent, PeerLink};
pub use loopback::{LoopbackFactory, LoopbackNetwork};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::MediaStreamHandle;
use crate::session::Session;

/// Errors reported by a peer transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Peer transport is closed")]
    Closed,

    #[error("Invalid transport state: {0}")]
    InvalidState(String),

    #[error("Session description rejected: {0}")]
    Sdp(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Statistics unavailable: {0}")]
    Stats(String),

    #[error("Transport failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer or answer, in the shape browsers exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Connectivity as reported by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications a transport pushes to its owner
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaStreamHandle),
    StateChanged(TransportState),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundVideoStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePairStats {
    pub current_round_trip_time_seconds: Option<f64>,
}

/// The subset of transport statistics quality sampling needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub inbound_video: Option<InboundVideoStats>,
    pub candidate_pair: Option<CandidatePairStats>,
}

/// Platform peer connection capability
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_stream(&self, stream: &MediaStreamHandle) -> Result<(), TransportError>;
    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn stats(&self) -> Result<TransportStats, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates one transport per negotiation attempt
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        session: &Session,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
