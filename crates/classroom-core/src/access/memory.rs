//! In-process stand-in for the authorization and telemetry services

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{
    AccessDecision, AccessError, AccessRequest, AccessValidator, PresenceEvent, PresenceRecord, PresenceTelemetry,
    SessionMetadata,
};
use crate::session::{ParticipantId, SessionId};

#[derive(Default)]
struct BackendState {
    sessions: HashMap<SessionId, SessionMetadata>,
    present: HashMap<SessionId, HashSet<ParticipantId>>,
    records: Vec<PresenceRecord>,
    failures: VecDeque<AccessError>,
    checks: usize,
}

/// Scheduled lessons plus live presence
///
/// Only the scheduled teacher and student are admitted, each at most once
/// until a `leave` is recorded, so no session ever has more than two holders.
#[derive(Clone, Default)]
pub struct InMemoryClassroomBackend {
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryClassroomBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, metadata: SessionMetadata) {
        self.state.lock().sessions.insert(metadata.session_id.clone(), metadata);
    }

    /// Schedule a lesson between `teacher` and `student`
    pub fn schedule_lesson(&self, session_id: &str, teacher: &str, student: &str) {
        self.schedule(SessionMetadata::lesson(session_id.into(), teacher.into(), student.into()));
    }

    /// Make the next check fail with `error`
    pub fn fail_next_check(&self, error: AccessError) {
        self.state.lock().failures.push_back(error);
    }

    /// Number of authorization checks served, failed ones included
    pub fn check_count(&self) -> usize {
        self.state.lock().checks
    }

    pub fn present(&self, session_id: &SessionId) -> Vec<ParticipantId> {
        let state = self.state.lock();
        let mut present: Vec<ParticipantId> = state
            .present
            .get(session_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        present.sort_by(|a, b| a.0.cmp(&b.0));
        present
    }

    /// Every telemetry record received, oldest first
    pub fn records(&self) -> Vec<PresenceRecord> {
        self.state.lock().records.clone()
    }
}

#[async_trait]
impl AccessValidator for InMemoryClassroomBackend {
    async fn validate(&self, request: &AccessRequest) -> Result<AccessDecision, AccessError> {
        let mut state = self.state.lock();
        state.checks += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let metadata = match state.sessions.get(&request.session_id) {
            Some(metadata) => metadata.clone(),
            None => return Ok(AccessDecision::deny("session not found")),
        };
        if metadata.role_of(&request.participant_id).is_none() {
            return Ok(AccessDecision::deny("not a participant of this session"));
        }
        let already_present = state
            .present
            .get(&request.session_id)
            .map(|p| p.contains(&request.participant_id))
            .unwrap_or(false);
        if already_present {
            return Ok(AccessDecision::deny("participant already joined"));
        }
        Ok(AccessDecision::allow(Some(metadata)))
    }
}

#[async_trait]
impl PresenceTelemetry for InMemoryClassroomBackend {
    async fn record(&self, record: &PresenceRecord) -> Result<(), AccessError> {
        let mut state = self.state.lock();
        let present = state.present.entry(record.session_id.clone()).or_default();
        match record.event {
            PresenceEvent::Join => {
                present.insert(record.participant_id.clone());
            }
            PresenceEvent::Leave => {
                present.remove(&record.participant_id);
            }
        }
        state.records.push(record.clone());
        Ok(())
    }
}
