//! In-process peer transport
//!
//! Every transport created from one [`LoopbackNetwork`] can reach every other.
//! Two transports pair up through the id embedded in their session
//! descriptions and connect once both sides hold a local and a remote
//! description and have applied at least one remote candidate, mirroring the
//! order a real ICE agent needs. The network can be severed, blocked and fed
//! failing statistics to exercise recovery paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    IceCandidate, PeerTransport, SdpType, SessionDescription, TransportError, TransportEvent, TransportFactory,
    TransportState, TransportStats,
};
use crate::media::{MediaStreamHandle, TrackKind};
use crate::session::Session;

const ID_ATTRIBUTE: &str = "a=loopback-id:";

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    kinds: Vec<TrackKind>,
    ready_peer: Option<u64>,
    linked_peer: Option<u64>,
}

#[derive(Default)]
struct NetInner {
    endpoints: Mutex<HashMap<u64, Endpoint>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    blocked: AtomicBool,
    stats: Mutex<TransportStats>,
    stat_failures: Mutex<VecDeque<TransportError>>,
}

/// Shared medium connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory { net: self.inner.clone() }
    }

    /// Number of transports created so far
    pub fn transports_created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of transports currently linked to a peer
    pub fn linked_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .values()
            .filter(|e| e.linked_peer.is_some())
            .count()
    }

    /// While blocked, pairs that finish negotiating report `failed` instead of connecting
    pub fn set_blocked(&self, blocked: bool) {
        self.inner.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Interrupt every established link
    pub fn sever(&self) -> usize {
        let mut endpoints = self.inner.endpoints.lock();
        let mut severed = 0;
        for endpoint in endpoints.values_mut() {
            if endpoint.linked_peer.take().is_some() {
                endpoint.ready_peer = None;
                let _ = endpoint.events.send(TransportEvent::StateChanged(TransportState::Disconnected));
                severed += 1;
            }
        }
        debug!("Loopback network severed {} endpoints", severed);
        severed
    }

    /// Statistics every transport reports
    pub fn set_stats(&self, stats: TransportStats) {
        *self.inner.stats.lock() = stats;
    }

    /// Make the next `stats()` call (on any transport) fail
    pub fn fail_next_stats(&self, error: TransportError) {
        self.inner.stat_failures.lock().push_back(error);
    }
}

/// [`TransportFactory`] handing out loopback transports
#[derive(Clone)]
pub struct LoopbackFactory {
    net: Arc<NetInner>,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        session: &Session,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let id = self.net.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.net.created.fetch_add(1, Ordering::SeqCst);
        self.net.endpoints.lock().insert(
            id,
            Endpoint {
                events,
                kinds: Vec::new(),
                ready_peer: None,
                linked_peer: None,
            },
        );
        debug!("Created loopback transport {} for {} ({})", id, session.participant_id, session.role);
        Ok(Arc::new(LoopbackTransport {
            id,
            net: self.net.clone(),
            side: Mutex::new(Side::default()),
        }))
    }
}

#[derive(Default)]
struct Side {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    streams: Vec<MediaStreamHandle>,
    closed: bool,
}

/// One end of a loopback link
pub struct LoopbackTransport {
    id: u64,
    net: Arc<NetInner>,
    side: Mutex<Side>,
}

impl LoopbackTransport {
    fn sdp(&self, sdp_type: SdpType) -> String {
        let kinds: Vec<&str> = self
            .side
            .lock()
            .streams
            .iter()
            .flat_map(|s| s.track_kinds())
            .map(|k| match k {
                TrackKind::Audio => "m=audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "m=video 9 UDP/TLS/RTP/SAVPF 96",
            })
            .collect();
        format!(
            "v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=classroom-{kind:?}\r\nt=0 0\r\n{attr}{id}\r\n{media}\r\n",
            attr = ID_ATTRIBUTE,
            id = self.id,
            kind = sdp_type,
            media = kinds.join("\r\n"),
        )
    }

    fn peer_id(description: &SessionDescription) -> Option<u64> {
        description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(ID_ATTRIBUTE))
            .and_then(|id| id.trim().parse().ok())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.side.lock().closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Link with the peer once both ends are ready
    fn try_link(&self) {
        let peer = {
            let side = self.side.lock();
            if side.closed || side.local.is_none() || side.remote_candidates == 0 {
                return;
            }
            match side.remote.as_ref().and_then(Self::peer_id) {
                Some(peer) => peer,
                None => return,
            }
        };

        let mut endpoints = self.net.endpoints.lock();
        match endpoints.get_mut(&self.id) {
            Some(me) if me.linked_peer.is_none() => me.ready_peer = Some(peer),
            _ => return,
        }
        let peer_ready = endpoints
            .get(&peer)
            .map(|p| p.ready_peer == Some(self.id) && p.linked_peer.is_none())
            .unwrap_or(false);
        if !peer_ready {
            return;
        }

        if self.net.blocked.load(Ordering::SeqCst) {
            for id in [self.id, peer] {
                if let Some(endpoint) = endpoints.get_mut(&id) {
                    endpoint.ready_peer = None;
                    let _ = endpoint.events.send(TransportEvent::StateChanged(TransportState::Failed));
                }
            }
            debug!("Loopback link {} <-> {} blocked", self.id, peer);
            return;
        }

        let my_kinds = endpoints.get(&self.id).map(|e| e.kinds.clone()).unwrap_or_default();
        let peer_kinds = endpoints.get(&peer).map(|e| e.kinds.clone()).unwrap_or_default();
        for (id, other, kinds) in [(self.id, peer, peer_kinds), (peer, self.id, my_kinds)] {
            if let Some(endpoint) = endpoints.get_mut(&id) {
                endpoint.linked_peer = Some(other);
                let _ = endpoint.events.send(TransportEvent::StateChanged(TransportState::Connected));
                if !kinds.is_empty() {
                    let _ = endpoint.events.send(TransportEvent::RemoteTrack(MediaStreamHandle::remote(&kinds)));
                }
            }
        }
        debug!("Loopback link {} <-> {} established", self.id, peer);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_stream(&self, stream: &MediaStreamHandle) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.side.lock().streams.push(stream.clone());

        let mut endpoints = self.net.endpoints.lock();
        let linked_peer = match endpoints.get_mut(&self.id) {
            Some(me) => {
                if me.kinds.is_empty() {
                    me.kinds = stream.track_kinds();
                }
                me.linked_peer
            }
            None => None,
        };
        // Streams added after linking show up on the far side right away
        if let Some(peer) = linked_peer.and_then(|id| endpoints.get(&id)) {
            let _ = peer
                .events
                .send(TransportEvent::RemoteTrack(MediaStreamHandle::remote(&stream.track_kinds())));
        }
        Ok(())
    }

    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut side = self.side.lock();
        let before = side.streams.len();
        side.streams.retain(|s| s.id() != stream_id);
        if side.streams.len() == before {
            return Err(TransportError::Media(format!("stream {} is not attached", stream_id)));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.sdp(SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.side.lock().remote.as_ref().map(|d| d.sdp_type),
            Some(SdpType::Offer)
        );
        if !has_offer {
            return Err(TransportError::InvalidState("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer(self.sdp(SdpType::Answer)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.side.lock().local = Some(description);

        let candidate = IceCandidate::new(format!(
            "candidate:{id} 1 udp 2122260223 127.0.0.1 {port} typ host",
            id = self.id,
            port = 40_000 + self.id,
        ));
        if let Some(me) = self.net.endpoints.lock().get(&self.id) {
            let _ = me.events.send(TransportEvent::LocalCandidate(candidate));
        }
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        if Self::peer_id(&description).is_none() {
            return Err(TransportError::Sdp("missing loopback id".to_string()));
        }
        {
            let mut side = self.side.lock();
            if description.sdp_type == SdpType::Answer
                && side.local.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer)
            {
                return Err(TransportError::InvalidState("answer without a local offer".to_string()));
            }
            side.remote = Some(description);
        }
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        {
            let mut side = self.side.lock();
            if side.remote.is_none() {
                return Err(TransportError::InvalidState(
                    "candidate applied before remote description".to_string(),
                ));
            }
            if !candidate.candidate.starts_with("candidate:") {
                return Err(TransportError::Candidate(candidate.candidate));
            }
            side.remote_candidates += 1;
        }
        self.try_link();
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ensure_open()?;
        if let Some(error) = self.net.stat_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(self.net.stats.lock().clone())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut side = self.side.lock();
            if side.closed {
                return Ok(());
            }
            side.closed = true;
        }

        let mut endpoints = self.net.endpoints.lock();
        if let Some(me) = endpoints.remove(&self.id) {
            if let Some(peer) = me.linked_peer.and_then(|id| endpoints.get_mut(&id)) {
                peer.linked_peer = None;
                peer.ready_peer = None;
                let _ = peer.events.send(TransportEvent::StateChanged(TransportState::Disconnected));
            }
        }
        debug!("Closed loopback transport {}", self.id);
        Ok(())
    }
}
