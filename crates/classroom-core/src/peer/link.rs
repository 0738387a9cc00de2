//! Connection state machine and negotiated link state
//!
//! ```text
//!  new ──► negotiating ──► awaiting-media ──► connected
//!              ▲   │              │               │
//!              │   └──────────────┴───► disconnected
//!              └────────────────────────────┘
//!  any ──► closed
//! ```
//!
//! `awaiting-media` means negotiation finished and the transport is up but no
//! remote track has arrived. It is reported separately from `connected`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

use super::{IceCandidate, SessionDescription};
use crate::media::MediaStreamHandle;

/// Connection state of the peer link as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    Negotiating,
    AwaitingMedia,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    /// Apply an event and return the next state
    ///
    /// `has_remote_track` is whether a remote track is attached after the event.
    pub fn on(self, event: LinkEvent, has_remote_track: bool) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;

        let next = match (self, event) {
            (Closed, LinkEvent::Closed) => Closed,
            (Closed, _) => return Err(InvalidTransition { from: self, event }),
            (_, LinkEvent::Closed) => Closed,

            (_, LinkEvent::NegotiationStarted) => Negotiating,

            (New, _) => return Err(InvalidTransition { from: self, event }),

            (Negotiating | Disconnected | AwaitingMedia | Connected, LinkEvent::TransportConnected) => {
                if has_remote_track {
                    Connected
                } else {
                    AwaitingMedia
                }
            }

            (AwaitingMedia, LinkEvent::RemoteTrackAdded) => Connected,
            (state, LinkEvent::RemoteTrackAdded) => state,

            (Connected | AwaitingMedia, LinkEvent::TransportInterrupted) => Disconnected,
            (state, LinkEvent::TransportInterrupted) => state,
        };
        Ok(next)
    }

    /// Anything but `closed`
    pub fn is_open(&self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::AwaitingMedia => "awaiting-media",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    NegotiationStarted,
    TransportConnected,
    RemoteTrackAdded,
    TransportInterrupted,
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: LinkEvent,
}

/// Candidates received before a remote description exists
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Take every buffered candidate in arrival order
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Point-in-time copy of a [`PeerLink`] for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct PeerLinkSnapshot {
    pub state: ConnectionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub applied_candidates: Vec<IceCandidate>,
    pub buffered_candidates: usize,
    pub has_remote_stream: bool,
    pub remote_secondary_streams: usize,
    pub generation: u64,
}

/// The negotiated link; owned by the orchestrator task only
#[derive(Debug)]
pub struct PeerLink {
    state: ConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    ice_candidates: Vec<IceCandidate>,
    pending: CandidateBuffer,
    remote_stream: Option<MediaStreamHandle>,
    remote_secondary: Vec<MediaStreamHandle>,
    generation: u64,
}

impl PeerLink {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::New,
            local_description: None,
            remote_description: None,
            ice_candidates: Vec::new(),
            pending: CandidateBuffer::default(),
            remote_stream: None,
            remote_secondary: Vec::new(),
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Feed an event; returns `(previous, next)` when the state changed
    pub fn apply(&mut self, event: LinkEvent) -> Result<Option<(ConnectionState, ConnectionState)>, InvalidTransition> {
        let previous = self.state;
        let next = previous.on(event, self.remote_stream.is_some())?;
        self.state = next;
        Ok((previous != next).then_some((previous, next)))
    }

    /// Forget everything negotiated so far; used before a fresh offer/answer
    pub fn reset_for_negotiation(&mut self) -> u64 {
        self.local_description = None;
        self.remote_description = None;
        self.ice_candidates.clear();
        self.pending.clear();
        self.remote_stream = None;
        self.remote_secondary.clear();
        self.generation += 1;
        self.generation
    }

    /// Like [`PeerLink::reset_for_negotiation`] but keeps candidates still
    /// waiting for a remote description; the responder resets on every offer
    /// and the initiator's candidates can overtake it
    pub fn reset_for_answer(&mut self) -> u64 {
        let pending = std::mem::take(&mut self.pending);
        let generation = self.reset_for_negotiation();
        self.pending = pending;
        generation
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn set_local_description(&mut self, description: SessionDescription) {
        self.local_description = Some(description);
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    /// Record the remote description and hand back candidates to apply now
    pub fn set_remote_description(&mut self, description: SessionDescription) -> Vec<IceCandidate> {
        self.remote_description = Some(description);
        self.pending.drain()
    }

    /// Buffer a candidate unless it can be applied right away
    pub fn accept_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.has_remote_description() {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    pub fn record_applied(&mut self, candidate: IceCandidate) {
        self.ice_candidates.push(candidate);
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Record a stream the peer sent; the first one of a negotiation is the
    /// primary (camera), later ones such as a screen share sit beside it.
    /// Returns true when it became the primary.
    pub fn add_remote_stream(&mut self, stream: MediaStreamHandle) -> bool {
        if self.remote_stream.is_none() {
            self.remote_stream = Some(stream);
            true
        } else {
            self.remote_secondary.push(stream);
            false
        }
    }

    pub fn remote_stream(&self) -> Option<&MediaStreamHandle> {
        self.remote_stream.as_ref()
    }

    pub fn remote_secondary_streams(&self) -> &[MediaStreamHandle] {
        &self.remote_secondary
    }

    pub fn snapshot(&self) -> PeerLinkSnapshot {
        PeerLinkSnapshot {
            state: self.state,
            local_description: self.local_description.clone(),
            remote_description: self.remote_description.clone(),
            applied_candidates: self.ice_candidates.clone(),
            buffered_candidates: self.pending.len(),
            has_remote_stream: self.remote_stream.is_some(),
            remote_secondary_streams: self.remote_secondary.len(),
            generation: self.generation,
        }
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use proptest::prelude::*;
    use super::ConnectionState::*;

    #[test]
    fn test_happy_path() {
        let s = New.on(LinkEvent::NegotiationStarted, false).unwrap();
        assert_eq!(s, Negotiating);
        let s = s.on(LinkEvent::RemoteTrackAdded, true).unwrap();
        assert_eq!(s, Negotiating);
        let s = s.on(LinkEvent::TransportConnected, true).unwrap();
        assert_eq!(s, Connected);
    }

    #[test]
    fn test_connected_requires_remote_track() {
        let s = Negotiating.on(LinkEvent::TransportConnected, false).unwrap();
        assert_eq!(s, AwaitingMedia);
        assert_eq!(s.on(LinkEvent::RemoteTrackAdded, true).unwrap(), Connected);
    }

    #[test]
    fn test_interruption_and_retry() {
        assert_eq!(Connected.on(LinkEvent::TransportInterrupted, true).unwrap(), Disconnected);
        assert_eq!(AwaitingMedia.on(LinkEvent::TransportInterrupted, false).unwrap(), Disconnected);
        assert_eq!(Disconnected.on(LinkEvent::NegotiationStarted, false).unwrap(), Negotiating);
        // interruption mid-negotiation is reported as a negotiation error instead
        assert_eq!(Negotiating.on(LinkEvent::TransportInterrupted, false).unwrap(), Negotiating);
    }

    #[test]
    fn test_closed_is_terminal() {
        for state in [New, Negotiating, AwaitingMedia, Connected, Disconnected] {
            assert_eq!(state.on(LinkEvent::Closed, false).unwrap(), Closed);
        }
        assert_eq!(Closed.on(LinkEvent::Closed, false).unwrap(), Closed);
        assert!(Closed.on(LinkEvent::NegotiationStarted, false).is_err());
        assert!(Closed.on(LinkEvent::TransportConnected, true).is_err());
    }

    #[test]
    fn test_new_rejects_transport_events() {
        assert_eq!(
            New.on(LinkEvent::TransportConnected, false).unwrap_err(),
            InvalidTransition { from: New, event: LinkEvent::TransportConnected }
        );
        assert!(New.on(LinkEvent::TransportInterrupted, false).is_err());
    }

    #[test]
    fn test_link_reports_changes_only() {
        let mut link = PeerLink::new();
        assert_eq!(link.apply(LinkEvent::NegotiationStarted).unwrap(), Some((New, Negotiating)));
        assert_eq!(link.apply(LinkEvent::NegotiationStarted).unwrap(), None);

        link.add_remote_stream(MediaStreamHandle::remote(&[TrackKind::Video]));
        assert_eq!(
            link.apply(LinkEvent::TransportConnected).unwrap(),
            Some((Negotiating, Connected))
        );
    }

    #[test]
    fn test_reset_clears_negotiated_state() {
        let mut link = PeerLink::new();
        link.set_local_description(SessionDescription::offer("v=0"));
        link.accept_candidate(IceCandidate::new("a"));
        let generation = link.reset_for_negotiation();

        assert_eq!(generation, 1);
        let snapshot = link.snapshot();
        assert!(snapshot.local_description.is_none());
        assert_eq!(snapshot.buffered_candidates, 0);
    }

    #[test]
    fn test_reset_for_answer_keeps_early_candidates() {
        let mut link = PeerLink::new();
        link.set_local_description(SessionDescription::answer("v=0"));
        assert!(link.accept_candidate(IceCandidate::new("candidate:1")).is_none());
        assert!(link.accept_candidate(IceCandidate::new("candidate:2")).is_none());

        assert_eq!(link.reset_for_answer(), 1);
        assert!(link.local_description().is_none());
        assert_eq!(link.buffered_candidates(), 2);

        let ready = link.set_remote_description(SessionDescription::offer("v=0"));
        assert_eq!(ready, vec![IceCandidate::new("candidate:1"), IceCandidate::new("candidate:2")]);
        assert_eq!(link.buffered_candidates(), 0);
    }

    #[test]
    fn test_later_remote_streams_do_not_replace_primary() {
        let mut link = PeerLink::new();
        let camera = MediaStreamHandle::remote(&[TrackKind::Audio, TrackKind::Video]);
        let screen = MediaStreamHandle::remote(&[TrackKind::Video]);

        assert!(link.add_remote_stream(camera.clone()));
        assert!(!link.add_remote_stream(screen.clone()));
        assert_eq!(link.remote_stream(), Some(&camera));
        assert_eq!(link.remote_secondary_streams(), &[screen][..]);
        assert_eq!(link.snapshot().remote_secondary_streams, 1);

        link.reset_for_negotiation();
        assert!(link.remote_stream().is_none());
        assert!(link.remote_secondary_streams().is_empty());
    }

    proptest! {
        #[test]
        fn buffered_then_flushed_equals_received(
            names in proptest::collection::vec("[a-z]{1,8}", 0..20),
            split in 0usize..20,
        ) {
            let mut link = PeerLink::new();
            let split = split.min(names.len());
            let received: Vec<IceCandidate> = names.iter().map(|n| IceCandidate::new(n.clone())).collect();

            for candidate in &received[..split] {
                prop_assert!(link.accept_candidate(candidate.clone()).is_none());
            }
            for candidate in link.set_remote_description(SessionDescription::answer("v=0")) {
                link.record_applied(candidate);
            }
            for candidate in &received[split..] {
                let ready = link.accept_candidate(candidate.clone());
                prop_assert!(ready.is_some());
                link.record_applied(candidate.clone());
            }

            let snapshot = link.snapshot();
            prop_assert_eq!(snapshot.buffered_candidates, 0);
            prop_assert_eq!(snapshot.applied_candidates, received);
        }
    }
}
