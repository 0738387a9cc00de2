//! Session orchestrator
//!
//! One actor task per participant owns the [`PeerLink`] and the platform
//! transport. Everything that touches negotiation goes through its loop:
//! commands from [`OrchestratorHandle`], signals from the relay, transport
//! notifications and the negotiation deadline. The teacher is the only side
//! that creates offers; the student answers whatever offer arrives last.
//!
//! The orchestrator reports failures but never retries on its own. The
//! recovery controller calls [`OrchestratorHandle::renegotiate`] for that.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NegotiationConfig;
use crate::error::{ClassroomError, ClassroomResult};
use crate::events::{ClassroomEvent, EventEmitter};
use crate::media::{MediaStreamHandle, StreamSink};
use crate::peer::link::PeerLinkSnapshot;
use crate::peer::{
    ConnectionState, IceCandidate, LinkEvent, PeerLink, PeerTransport, SessionDescription, TransportError,
    TransportEvent, TransportFactory, TransportState, TransportStats,
};
use crate::quality::StatsSource;
use crate::recovery::Reconnect;
use crate::relay::{RelayChannel, RelaySubscription, SignalBody, SignalMessage};
use crate::session::Session;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        local: MediaStreamHandle,
        reply: Reply<ClassroomResult<()>>,
    },
    Renegotiate {
        reply: Reply<ClassroomResult<()>>,
    },
    AttachSecondary {
        stream: MediaStreamHandle,
        reply: Reply<Result<(), TransportError>>,
    },
    DetachSecondary {
        stream_id: String,
        reply: Reply<Result<(), TransportError>>,
    },
    ReplacePrimary {
        stream: MediaStreamHandle,
        reply: Reply<ClassroomResult<()>>,
    },
    Stats {
        reply: Reply<Result<TransportStats, TransportError>>,
    },
    Snapshot {
        reply: Reply<PeerLinkSnapshot>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// The actor; only reachable through [`OrchestratorHandle`]
pub struct SessionOrchestrator {
    session: Session,
    config: NegotiationConfig,
    relay: Arc<dyn RelayChannel>,
    factory: Arc<dyn TransportFactory>,
    emitter: Arc<EventEmitter>,
    link: PeerLink,
    transport: Option<Arc<dyn PeerTransport>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    local_stream: Option<MediaStreamHandle>,
    secondary: Vec<MediaStreamHandle>,
    deadline: Option<Instant>,
    started: bool,
    early_signals: Vec<SignalMessage>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionOrchestrator {
    /// Subscribe to the session's relay channel and start the actor
    ///
    /// Nothing is negotiated until [`OrchestratorHandle::start`] hands over
    /// the local stream.
    pub async fn spawn(
        session: Session,
        config: &NegotiationConfig,
        relay: Arc<dyn RelayChannel>,
        factory: Arc<dyn TransportFactory>,
        emitter: Arc<EventEmitter>,
    ) -> ClassroomResult<OrchestratorHandle> {
        let subscription = relay.subscribe(&session.session_id).await?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);

        let actor = SessionOrchestrator {
            session: session.clone(),
            config: config.clone(),
            relay,
            factory,
            emitter,
            link: PeerLink::new(),
            transport: None,
            transport_events: None,
            local_stream: None,
            secondary: Vec::new(),
            deadline: None,
            started: false,
            early_signals: Vec::new(),
            state_tx,
        };
        info!(
            session_id = %session.session_id,
            participant_id = %session.participant_id,
            role = %session.role,
            "Session orchestrator started"
        );
        tokio::spawn(actor.run(commands_rx, subscription));

        Ok(OrchestratorHandle {
            session,
            commands: commands_tx,
            state: state_rx,
        })
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut subscription: RelaySubscription) {
        let mut relay_open = true;
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.teardown().await;
                        drop(subscription);
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                message = subscription.recv(), if relay_open => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        relay_open = false;
                        self.report(&ClassroomError::Signaling(crate::relay::RelayError::Connection(
                            "relay subscription ended".to_string(),
                        )))
                        .await;
                    }
                },
                event = next_transport_event(&mut self.transport_events) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => self.transport_events = None,
                },
                _ = wait_deadline(deadline) => self.on_negotiation_timeout().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { local, reply } => {
                let result = self.start(local).await;
                let _ = reply.send(result);
            }
            Command::Renegotiate { reply } => {
                let result = self.renegotiate().await;
                let _ = reply.send(result);
            }
            Command::AttachSecondary { stream, reply } => {
                let result = match &self.transport {
                    Some(transport) => transport.add_stream(&stream).await,
                    None => Err(TransportError::InvalidState("no peer link".to_string())),
                };
                if result.is_ok() {
                    debug!("Attached secondary stream {}", stream.id());
                    self.secondary.push(stream);
                }
                let _ = reply.send(result);
            }
            Command::DetachSecondary { stream_id, reply } => {
                self.secondary.retain(|s| s.id() != stream_id);
                let result = match &self.transport {
                    Some(transport) => transport.remove_stream(&stream_id).await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::ReplacePrimary { stream, reply } => {
                let result = self.replace_primary(stream).await;
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let result = match &self.transport {
                    Some(transport) => transport.stats().await,
                    None if self.link.state() == ConnectionState::Closed => Err(TransportError::Closed),
                    None => Err(TransportError::InvalidState("no peer link yet".to_string())),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.link.snapshot());
            }
            // handled by the loop
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self, local: MediaStreamHandle) -> ClassroomResult<()> {
        if self.started {
            return Err(ClassroomError::internal("orchestrator already started"));
        }
        self.started = true;
        self.local_stream = Some(local);

        let result = if self.session.is_initiator() {
            self.begin_offer().await
        } else {
            self.await_offer().await;
            Ok(())
        };
        if let Err(e) = &result {
            self.report(e).await;
        }

        for message in std::mem::take(&mut self.early_signals) {
            self.handle_signal(message).await;
        }
        result
    }

    async fn renegotiate(&mut self) -> ClassroomResult<()> {
        if self.link.state() == ConnectionState::Closed {
            return Err(ClassroomError::SessionClosed);
        }
        if !self.started {
            return Err(ClassroomError::internal("orchestrator not started"));
        }

        if self.session.is_initiator() {
            info!(session_id = %self.session.session_id, "Re-negotiating peer link");
            let result = self.begin_offer().await;
            if let Err(e) = &result {
                self.report(e).await;
            }
            result
        } else if matches!(self.link.state(), ConnectionState::Connected | ConnectionState::AwaitingMedia) {
            debug!("Peer link is up ({}), nothing to re-negotiate", self.link.state());
            Ok(())
        } else {
            // the responder can only wait for the initiator's next offer
            self.await_offer().await;
            Ok(())
        }
    }

    async fn await_offer(&mut self) {
        self.transition(LinkEvent::NegotiationStarted).await;
        self.arm_deadline();
        debug!("Waiting for an offer in {}", self.session.session_id);
    }

    async fn begin_offer(&mut self) -> ClassroomResult<()> {
        let transport = self.reset_transport(false).await?;
        self.transition(LinkEvent::NegotiationStarted).await;
        self.arm_deadline();

        let offer = transport
            .create_offer()
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to create offer: {}", e)))?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to apply local offer: {}", e)))?;
        self.link.set_local_description(offer.clone());
        self.send(SignalBody::Offer(offer))
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to send offer: {}", e)))?;
        debug!("Offer sent for generation {}", self.link.generation());
        Ok(())
    }

    /// Close the current transport and open a fresh one with our streams attached
    ///
    /// `keep_pending` keeps remote candidates that arrived ahead of the offer.
    async fn reset_transport(&mut self, keep_pending: bool) -> ClassroomResult<Arc<dyn PeerTransport>> {
        if let Some(old) = self.transport.take() {
            if let Err(e) = old.close().await {
                debug!("Closing previous transport failed: {}", e);
            }
        }
        self.transport_events = None;
        let generation = if keep_pending {
            self.link.reset_for_answer()
        } else {
            self.link.reset_for_negotiation()
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self
            .factory
            .create(&self.session, events_tx)
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to create peer transport: {}", e)))?;
        if let Some(local) = &self.local_stream {
            transport
                .add_stream(local)
                .await
                .map_err(|e| ClassroomError::negotiation(format!("failed to attach local media: {}", e)))?;
        }
        for stream in &self.secondary {
            if let Err(e) = transport.add_stream(stream).await {
                warn!("Failed to re-attach secondary stream {}: {}", stream.id(), e);
            }
        }

        self.transport = Some(transport.clone());
        self.transport_events = Some(events_rx);
        debug!("Peer transport generation {} ready", generation);
        Ok(transport)
    }

    async fn replace_primary(&mut self, stream: MediaStreamHandle) -> ClassroomResult<()> {
        let previous = self.local_stream.replace(stream.clone());
        if let Some(transport) = &self.transport {
            if let Some(previous) = previous {
                if let Err(e) = transport.remove_stream(previous.id()).await {
                    debug!("Previous local stream was not attached: {}", e);
                }
            }
            transport.add_stream(&stream).await?;
        }
        info!("Local media replaced with stream {}", stream.id());
        Ok(())
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        if message.session_id != self.session.session_id {
            debug!("Ignoring signal for session {}", message.session_id);
            return;
        }
        if message.sender_id == self.session.participant_id {
            return;
        }
        if self.link.state() == ConnectionState::Closed {
            return;
        }
        if !self.started {
            self.early_signals.push(message);
            return;
        }

        let body = match message.body() {
            Ok(body) => body,
            Err(e) => {
                warn!("Dropping undecodable signal from {}: {}", message.sender_id, e);
                return;
            }
        };

        let result = match body {
            SignalBody::Offer(offer) if !self.session.is_initiator() => self.on_offer(offer).await,
            SignalBody::Offer(_) => {
                warn!("Ignoring offer from {}; only the teacher initiates", message.sender_id);
                Ok(())
            }
            SignalBody::Answer(answer) if self.session.is_initiator() => self.on_answer(answer).await,
            SignalBody::Answer(_) => {
                debug!("Ignoring answer sent to the responder");
                Ok(())
            }
            SignalBody::IceCandidate(candidate) => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.report(&e).await;
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> ClassroomResult<()> {
        if self.link.has_remote_description() {
            info!(session_id = %self.session.session_id, "Fresh offer received, resetting peer link");
        }
        let transport = self.reset_transport(true).await?;
        self.transition(LinkEvent::NegotiationStarted).await;
        self.arm_deadline();

        transport
            .set_remote_description(offer.clone())
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to apply offer: {}", e)))?;
        let ready = self.link.set_remote_description(offer);
        if !ready.is_empty() {
            debug!("Flushing {} candidates received ahead of the offer", ready.len());
        }
        for candidate in ready {
            self.apply_candidate(candidate).await;
        }

        let answer = transport
            .create_answer()
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to create answer: {}", e)))?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to apply local answer: {}", e)))?;
        self.link.set_local_description(answer.clone());
        self.send(SignalBody::Answer(answer))
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to send answer: {}", e)))?;
        debug!("Answer sent for generation {}", self.link.generation());
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> ClassroomResult<()> {
        let expecting = self.link.local_description().is_some() && !self.link.has_remote_description();
        let transport = match (&self.transport, expecting) {
            (Some(transport), true) => transport.clone(),
            _ => {
                debug!("Ignoring unexpected answer");
                return Ok(());
            }
        };

        transport
            .set_remote_description(answer.clone())
            .await
            .map_err(|e| ClassroomError::negotiation(format!("failed to apply answer: {}", e)))?;
        let ready = self.link.set_remote_description(answer);
        if !ready.is_empty() {
            debug!("Flushing {} buffered candidates", ready.len());
        }
        for candidate in ready {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.link.accept_candidate(candidate) {
            Some(candidate) => self.apply_candidate(candidate).await,
            None => debug!("Buffered candidate ({} pending)", self.link.buffered_candidates()),
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        match transport.add_ice_candidate(candidate.clone()).await {
            Ok(()) => self.link.record_applied(candidate),
            Err(e) => warn!("Remote candidate rejected: {}", e),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send(SignalBody::IceCandidate(candidate)).await {
                    warn!("Failed to send local candidate: {}", e);
                }
            }
            TransportEvent::RemoteTrack(stream) => {
                if self.link.add_remote_stream(stream.clone()) {
                    debug!("Remote stream {} with {:?}", stream.id(), stream.track_kinds());
                } else {
                    debug!("Additional remote stream {} with {:?}", stream.id(), stream.track_kinds());
                }
                self.emitter
                    .emit(ClassroomEvent::RemoteStream {
                        session_id: self.session.session_id.clone(),
                        stream,
                    })
                    .await;
                self.transition(LinkEvent::RemoteTrackAdded).await;
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                self.transition(LinkEvent::TransportConnected).await;
            }
            TransportEvent::StateChanged(TransportState::Disconnected) => {
                self.transition(LinkEvent::TransportInterrupted).await;
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                if self.link.state() == ConnectionState::Negotiating {
                    self.deadline = None;
                    self.report(&ClassroomError::negotiation("connectivity checks failed")).await;
                } else {
                    self.transition(LinkEvent::TransportInterrupted).await;
                    self.report(&ClassroomError::Transport(TransportError::Failed(
                        "peer transport failed".to_string(),
                    )))
                    .await;
                }
            }
            TransportEvent::StateChanged(state) => debug!("Transport state {:?}", state),
        }
    }

    async fn on_negotiation_timeout(&mut self) {
        self.deadline = None;
        let state = self.link.state();
        warn!(session_id = %self.session.session_id, "Negotiation timed out in state {}", state);
        let reason = match state {
            ConnectionState::AwaitingMedia => "no remote media received",
            _ if self.session.is_initiator() => "no answer received",
            _ => "no offer received",
        };
        self.report(&ClassroomError::negotiation(format!(
            "{} within {:?}",
            reason,
            self.config.timeout()
        )))
        .await;
    }

    async fn teardown(&mut self) {
        self.deadline = None;
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Transport close failed: {}", e);
            }
        }
        self.transport_events = None;
        self.transition(LinkEvent::Closed).await;
        info!(session_id = %self.session.session_id, "Session orchestrator closed");
    }

    async fn transition(&mut self, event: LinkEvent) {
        match self.link.apply(event) {
            Ok(Some((previous, next))) => {
                info!(session_id = %self.session.session_id, "Connection state {} -> {}", previous, next);
                if next == ConnectionState::Connected {
                    self.deadline = None;
                }
                self.state_tx.send_replace(next);
                self.emitter
                    .emit(ClassroomEvent::connection_state(self.session.session_id.clone(), previous, next))
                    .await;
            }
            Ok(None) => {}
            Err(e) => debug!("Ignoring {}", e),
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.config.timeout());
    }

    async fn send(&self, body: SignalBody) -> Result<(), crate::relay::RelayError> {
        let message = SignalMessage::new(self.session.session_id.clone(), self.session.participant_id.clone(), &body)?;
        self.relay.publish(message).await
    }

    async fn report(&self, err: &ClassroomError) {
        warn!(session_id = %self.session.session_id, "{}", err);
        self.emitter
            .emit(ClassroomEvent::error(self.session.session_id.clone(), err.kind(), err.to_string()))
            .await;
    }
}

async fn next_transport_event(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running [`SessionOrchestrator`]
#[derive(Clone)]
pub struct OrchestratorHandle {
    session: Session,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl OrchestratorHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> ClassroomResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| ClassroomError::SessionClosed)?;
        rx.await.map_err(|_| ClassroomError::SessionClosed)
    }

    /// Attach local media and begin negotiating
    pub async fn start(&self, local: MediaStreamHandle) -> ClassroomResult<()> {
        self.request(|reply| Command::Start { local, reply }).await?
    }

    /// Public re-negotiation entry point
    pub async fn renegotiate(&self) -> ClassroomResult<()> {
        self.request(|reply| Command::Renegotiate { reply }).await?
    }

    pub async fn attach_stream(&self, stream: MediaStreamHandle) -> Result<(), TransportError> {
        self.request(|reply| Command::AttachSecondary { stream, reply })
            .await
            .map_err(|_| TransportError::Closed)?
    }

    pub async fn detach_stream(&self, stream_id: &str) -> Result<(), TransportError> {
        let stream_id = stream_id.to_string();
        self.request(|reply| Command::DetachSecondary { stream_id, reply })
            .await
            .map_err(|_| TransportError::Closed)?
    }

    /// Swap the primary stream, e.g. after the user picked another camera
    pub async fn replace_primary_stream(&self, stream: MediaStreamHandle) -> ClassroomResult<()> {
        self.request(|reply| Command::ReplacePrimary { stream, reply }).await?
    }

    pub async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.request(|reply| Command::Stats { reply })
            .await
            .map_err(|_| TransportError::Closed)?
    }

    pub async fn snapshot(&self) -> ClassroomResult<PeerLinkSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Close the transport, then drop the relay subscription
    ///
    /// Closing twice is fine.
    pub async fn close(&self) -> ClassroomResult<()> {
        match self.request(|reply| Command::Close { reply }).await {
            Ok(()) | Err(ClassroomError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StatsSource for OrchestratorHandle {
    async fn stats(&self) -> Result<TransportStats, TransportError> {
        OrchestratorHandle::stats(self).await
    }
}

#[async_trait]
impl StreamSink for OrchestratorHandle {
    async fn attach_secondary(&self, stream: MediaStreamHandle) -> Result<(), TransportError> {
        self.attach_stream(stream).await
    }

    async fn detach_secondary(&self, stream_id: &str) -> Result<(), TransportError> {
        self.detach_stream(stream_id).await
    }
}

#[async_trait]
impl Reconnect for OrchestratorHandle {
    async fn attempt_reconnect(&self) -> ClassroomResult<()> {
        self.renegotiate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::media::{MediaTrack, StreamOrigin, TrackKind};
    use crate::peer::LoopbackNetwork;
    use crate::relay::{InMemoryRelay, SignalKind};
    use crate::session::{ParticipantId, Role};
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Rig {
        relay: InMemoryRelay,
        net: LoopbackNetwork,
        emitter: Arc<EventEmitter>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                relay: InMemoryRelay::new(),
                net: LoopbackNetwork::new(),
                emitter: Arc::new(EventEmitter::new()),
            }
        }

        async fn participant(&self, role: Role) -> OrchestratorHandle {
            let id = match role {
                Role::Teacher => "tea-1",
                Role::Student => "stu-1",
            };
            let session = Session::new("lesson".into(), role, id.into());
            SessionOrchestrator::spawn(
                session,
                &NegotiationConfig::default(),
                Arc::new(self.relay.clone()),
                Arc::new(self.net.factory()),
                self.emitter.clone(),
            )
            .await
            .unwrap()
        }
    }

    fn camera() -> MediaStreamHandle {
        MediaStreamHandle::new(
            StreamOrigin::Camera,
            vec![
                MediaTrack::new(TrackKind::Audio, "mic", None),
                MediaTrack::new(TrackKind::Video, "cam", None),
            ],
        )
    }

    async fn wait_for(handle: &OrchestratorHandle, target: ConnectionState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", target))
            .unwrap();
    }

    async fn next_error(events: &mut broadcast::Receiver<ClassroomEvent>) -> (ErrorKind, String) {
        loop {
            if let ClassroomEvent::Error { kind, message, .. } = events.recv().await.unwrap() {
                return (kind, message);
            }
        }
    }

    async fn connected_pair(rig: &Rig) -> (OrchestratorHandle, OrchestratorHandle) {
        let student = rig.participant(Role::Student).await;
        let teacher = rig.participant(Role::Teacher).await;
        student.start(camera()).await.unwrap();
        teacher.start(camera()).await.unwrap();
        wait_for(&teacher, ConnectionState::Connected).await;
        wait_for(&student, ConnectionState::Connected).await;
        (teacher, student)
    }

    #[tokio::test]
    async fn test_teacher_and_student_connect() {
        let rig = Rig::new();
        let mut events = rig.emitter.listen();
        let (teacher, student) = connected_pair(&rig).await;

        let snapshot = teacher.snapshot().await.unwrap();
        assert!(snapshot.has_remote_stream);
        assert_eq!(snapshot.buffered_candidates, 0);
        assert_eq!(snapshot.applied_candidates.len(), 1);

        let offers = rig.relay.published().iter().filter(|m| m.kind == SignalKind::Offer).count();
        assert_eq!(offers, 1);
        assert!(rig.relay.published().iter().all(|m| m.kind != SignalKind::Offer || m.sender_id == ParticipantId::from("tea-1")));

        let mut remote_streams = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClassroomEvent::RemoteStream { .. }) {
                remote_streams += 1;
            }
        }
        assert_eq!(remote_streams, 2);
        assert!(student.stats().await.is_ok());
    }

    #[tokio::test]
    async fn test_own_and_foreign_signals_are_ignored() {
        let rig = Rig::new();
        let teacher = rig.participant(Role::Teacher).await;
        teacher.start(camera()).await.unwrap();

        let answer = SignalBody::Answer(SessionDescription::answer("v=0\r\na=loopback-id:99\r\n"));
        rig.relay
            .publish(SignalMessage::new("lesson".into(), "tea-1".into(), &answer).unwrap())
            .await
            .unwrap();
        rig.relay
            .publish(SignalMessage::new("other".into(), "stu-1".into(), &answer).unwrap())
            .await
            .unwrap();

        let snapshot = teacher.snapshot().await.unwrap();
        assert!(snapshot.remote_description.is_none());
        assert_eq!(snapshot.state, ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_buffered() {
        let rig = Rig::new();
        let student = rig.participant(Role::Student).await;
        student.start(camera()).await.unwrap();

        let candidate = SignalBody::IceCandidate(IceCandidate::new("candidate:7 1 udp 1 127.0.0.1 4000 typ host"));
        rig.relay
            .publish(SignalMessage::new("lesson".into(), "tea-1".into(), &candidate).unwrap())
            .await
            .unwrap();

        let mut buffered = 0;
        for _ in 0..50 {
            buffered = student.snapshot().await.unwrap().buffered_candidates;
            if buffered == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(buffered, 1);
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_applied_with_it() {
        let rig = Rig::new();
        let student = rig.participant(Role::Student).await;
        student.start(camera()).await.unwrap();

        let candidate = IceCandidate::new("candidate:7 1 udp 1 127.0.0.1 4000 typ host");
        let body = SignalBody::IceCandidate(candidate.clone());
        rig.relay
            .publish(SignalMessage::new("lesson".into(), "tea-1".into(), &body).unwrap())
            .await
            .unwrap();
        let offer = SignalBody::Offer(SessionDescription::offer("v=0\r\na=loopback-id:99\r\n"));
        rig.relay
            .publish(SignalMessage::new("lesson".into(), "tea-1".into(), &offer).unwrap())
            .await
            .unwrap();

        let mut snapshot = student.snapshot().await.unwrap();
        for _ in 0..50 {
            if snapshot.remote_description.is_some() {
                break;
            }
            tokio::task::yield_now().await;
            snapshot = student.snapshot().await.unwrap();
        }
        assert!(snapshot.remote_description.is_some());
        assert_eq!(snapshot.buffered_candidates, 0);
        assert_eq!(snapshot.applied_candidates, vec![candidate]);
        assert_eq!(snapshot.generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_times_out_without_offer() {
        let rig = Rig::new();
        let mut events = rig.emitter.listen();
        let student = rig.participant(Role::Student).await;
        student.start(camera()).await.unwrap();

        let (kind, message) = next_error(&mut events).await;
        assert_eq!(kind, ErrorKind::Negotiation);
        assert!(message.contains("no offer received"), "{}", message);
        assert_eq!(student.state(), ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_sever_then_renegotiate() {
        let rig = Rig::new();
        let (teacher, student) = connected_pair(&rig).await;

        rig.net.sever();
        wait_for(&teacher, ConnectionState::Disconnected).await;
        wait_for(&student, ConnectionState::Disconnected).await;

        teacher.renegotiate().await.unwrap();
        wait_for(&teacher, ConnectionState::Connected).await;
        wait_for(&student, ConnectionState::Connected).await;
        assert_eq!(teacher.snapshot().await.unwrap().generation, 2);
        assert_eq!(rig.net.transports_created(), 4);
    }

    #[tokio::test]
    async fn test_blocked_link_reports_negotiation_error() {
        let rig = Rig::new();
        let mut events = rig.emitter.listen();
        rig.net.set_blocked(true);

        let student = rig.participant(Role::Student).await;
        let teacher = rig.participant(Role::Teacher).await;
        student.start(camera()).await.unwrap();
        teacher.start(camera()).await.unwrap();

        let (kind, message) = next_error(&mut events).await;
        assert_eq!(kind, ErrorKind::Negotiation);
        assert!(message.contains("connectivity checks failed"));
    }

    #[tokio::test]
    async fn test_close_tears_down_in_order() {
        let rig = Rig::new();
        let (teacher, student) = connected_pair(&rig).await;
        assert_eq!(rig.relay.subscriber_count(&"lesson".into()), 2);

        teacher.close().await.unwrap();
        assert_eq!(teacher.state(), ConnectionState::Closed);
        assert!(matches!(teacher.stats().await, Err(TransportError::Closed)));
        wait_for(&student, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rig.relay.subscriber_count(&"lesson".into()), 1);
        assert!(teacher.close().await.is_ok());
        assert!(matches!(teacher.renegotiate().await, Err(ClassroomError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_secondary_stream_reaches_peer() {
        let rig = Rig::new();
        let mut events = rig.emitter.listen();
        let (teacher, student) = connected_pair(&rig).await;
        while events.try_recv().is_ok() {}
        let camera_snapshot = student.snapshot().await.unwrap();

        let display = MediaStreamHandle::new(StreamOrigin::Display, vec![MediaTrack::new(TrackKind::Video, "screen", None)]);
        teacher.attach_secondary(display.clone()).await.unwrap();

        let remote = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ClassroomEvent::RemoteStream { stream, .. }) = events.recv().await {
                    return stream;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(remote.track_kinds(), vec![TrackKind::Video]);

        // the screen share sits beside the camera stream
        let snapshot = student.snapshot().await.unwrap();
        assert!(snapshot.has_remote_stream);
        assert_eq!(snapshot.remote_secondary_streams, 1);
        assert_eq!(camera_snapshot.remote_secondary_streams, 0);
        assert_eq!(student.state(), ConnectionState::Connected);

        assert!(teacher.detach_secondary(display.id()).await.is_ok());
        assert_eq!(teacher.state(), ConnectionState::Connected);
    }
}
