//! Shared fixture: one scheduled lesson over the in-memory relay and loopback network
#![allow(dead_code)]

use classroom_core::access::InMemoryClassroomBackend;
use classroom_core::media::{MemoryPreferenceStore, MockMediaSource};
use classroom_core::relay::SignalKind;
use classroom_core::{
    ClassroomConfig, ClassroomDeps, ClassroomEvent, ClassroomResult, ClassroomSession, ConnectionState, EventEmitter,
    InMemoryRelay, JoinRequest, LoopbackNetwork, ParticipantId, Role,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

pub const SESSION: &str = "lesson-42";
pub const TEACHER: &str = "tea-1";
pub const STUDENT: &str = "stu-1";

const WAIT: Duration = Duration::from_secs(60);

pub struct Classroom {
    pub backend: InMemoryClassroomBackend,
    pub relay: InMemoryRelay,
    pub net: LoopbackNetwork,
    pub config: ClassroomConfig,
}

pub struct Participant {
    pub session: ClassroomSession,
    pub media: MockMediaSource,
    pub events: broadcast::Receiver<ClassroomEvent>,
}

impl Classroom {
    pub fn new() -> Self {
        let backend = InMemoryClassroomBackend::new();
        backend.schedule_lesson(SESSION, TEACHER, STUDENT);
        Self {
            backend,
            relay: InMemoryRelay::new(),
            net: LoopbackNetwork::new(),
            config: ClassroomConfig::default(),
        }
    }

    pub fn deps(&self, media: &MockMediaSource, emitter: Arc<EventEmitter>) -> ClassroomDeps {
        ClassroomDeps {
            validator: Arc::new(self.backend.clone()),
            telemetry: Arc::new(self.backend.clone()),
            media: Arc::new(media.clone()),
            preferences: Arc::new(MemoryPreferenceStore::new()),
            relay: Arc::new(self.relay.clone()),
            transports: Arc::new(self.net.factory()),
            emitter,
        }
    }

    pub async fn join(&self, participant: &str, role: Role) -> ClassroomResult<Participant> {
        self.join_with(participant, role, MockMediaSource::new()).await
    }

    pub async fn join_with(&self, participant: &str, role: Role, media: MockMediaSource) -> ClassroomResult<Participant> {
        let emitter = Arc::new(EventEmitter::new());
        let events = emitter.listen();
        let session = ClassroomSession::join(
            &self.config,
            self.deps(&media, emitter),
            JoinRequest::new(SESSION, participant, role),
        )
        .await?;
        Ok(Participant { session, media, events })
    }

    /// Student first, so the teacher's offer has someone to reach
    pub async fn connected_pair(&self) -> (Participant, Participant) {
        let student = self.join(STUDENT, Role::Student).await.unwrap();
        let teacher = self.join(TEACHER, Role::Teacher).await.unwrap();
        wait_for_state(&teacher, ConnectionState::Connected).await;
        wait_for_state(&student, ConnectionState::Connected).await;
        (teacher, student)
    }

    pub fn offers_from(&self, participant: &str) -> usize {
        let sender = ParticipantId::from(participant);
        self.relay
            .published()
            .iter()
            .filter(|m| m.kind == SignalKind::Offer && m.sender_id == sender)
            .count()
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_state(participant: &Participant, state: ConnectionState) {
    let what = format!("{} to be {}", participant.session.session().participant_id, state);
    eventually(&what, || participant.session.connection_state() == state).await;
}

impl Participant {
    /// Next event matching `matches`, skipping the rest
    pub async fn wait_event(&mut self, what: &str, mut matches: impl FnMut(&ClassroomEvent) -> bool) -> ClassroomEvent {
        let found = timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if matches(&event) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            _ => panic!("no event: {}", what),
        }
    }

    /// Everything received so far without waiting
    pub fn drain_events(&mut self) -> Vec<ClassroomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
