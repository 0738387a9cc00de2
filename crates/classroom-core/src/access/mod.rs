//! Access guard
//!
//! Entry to a classroom is decided by an external, server-trusted validation
//! function. The participant's claimed role is forwarded as a hint only; the
//! role of the resulting [`Session`] comes from the metadata the server returns.
//! Join and leave telemetry is fire-and-forget and never blocks entry.

pub mod http;
pub mod memory;

pub use http::{HttpAccessValidator, HttpPresenceTelemetry};
pub use memory::InMemoryClassroomBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AccessConfig;
use crate::session::{ParticipantId, Role, Session, SessionId};

/// Failures while talking to the authorization or telemetry service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccessError {
    #[error("Authorization service unavailable: {0}")]
    Transient(String),

    #[error("Authorization service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed authorization response: {0}")]
    Malformed(String),
}

impl AccessError {
    /// Network-level failures that may succeed on another try
    pub fn is_transient(&self) -> bool {
        matches!(self, AccessError::Transient(_))
    }
}

/// Body of the authorization check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub claimed_role: Role,
}

impl AccessRequest {
    pub fn new(session_id: SessionId, participant_id: ParticipantId, claimed_role: Role) -> Self {
        Self {
            session_id,
            participant_id,
            claimed_role,
        }
    }
}

/// Trusted facts about a scheduled classroom meeting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: SessionId,
    #[serde(default)]
    pub teacher_id: Option<ParticipantId>,
    #[serde(default)]
    pub student_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

impl SessionMetadata {
    pub fn lesson(session_id: SessionId, teacher_id: ParticipantId, student_id: ParticipantId) -> Self {
        Self {
            session_id,
            teacher_id: Some(teacher_id),
            student_id: Some(student_id),
            title: None,
            scheduled_start: None,
            duration_minutes: None,
        }
    }

    /// Whether the metadata names any participant at all
    pub fn has_roster(&self) -> bool {
        self.teacher_id.is_some() || self.student_id.is_some()
    }

    pub fn role_of(&self, participant_id: &ParticipantId) -> Option<Role> {
        if self.teacher_id.as_ref() == Some(participant_id) {
            Some(Role::Teacher)
        } else if self.student_id.as_ref() == Some(participant_id) {
            Some(Role::Student)
        } else {
            None
        }
    }
}

/// Response of the authorization check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionMetadata>,
}

impl AccessDecision {
    pub fn allow(session: Option<SessionMetadata>) -> Self {
        Self {
            is_valid: true,
            message: None,
            session,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: Some(message.into()),
            session: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Join,
    Leave,
}

/// One join/leave telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub role: Role,
    pub event: PresenceEvent,
}

impl PresenceRecord {
    pub fn new(session: &Session, event: PresenceEvent) -> Self {
        Self {
            session_id: session.session_id.clone(),
            participant_id: session.participant_id.clone(),
            role: session.role,
            event,
        }
    }
}

/// Server-trusted authorization check
#[async_trait]
pub trait AccessValidator: Send + Sync {
    async fn validate(&self, request: &AccessRequest) -> Result<AccessDecision, AccessError>;
}

/// Join/leave audit sink
#[async_trait]
pub trait PresenceTelemetry: Send + Sync {
    async fn record(&self, record: &PresenceRecord) -> Result<(), AccessError>;
}

/// Everything a granted participant needs to enter the classroom
#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrant {
    pub session: Session,
    pub metadata: Option<SessionMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccessOutcome {
    Granted(AccessGrant),
    Denied { reason: String },
}

impl AccessOutcome {
    fn denied(reason: impl Into<String>) -> Self {
        AccessOutcome::Denied { reason: reason.into() }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, AccessOutcome::Granted(_))
    }
}

/// Gate in front of every classroom session
#[derive(Clone)]
pub struct AccessGuard {
    validator: Arc<dyn AccessValidator>,
    telemetry: Arc<dyn PresenceTelemetry>,
    transient_retries: u32,
    retry_delay: Duration,
}

impl AccessGuard {
    pub fn new(
        validator: Arc<dyn AccessValidator>,
        telemetry: Arc<dyn PresenceTelemetry>,
        config: &AccessConfig,
    ) -> Self {
        Self {
            validator,
            telemetry,
            transient_retries: config.transient_retries,
            retry_delay: config.retry_delay(),
        }
    }

    /// Ask the trusted service whether this participant may enter
    ///
    /// Transient failures are retried `transient_retries` times and then
    /// treated as a denial. The role always comes from the session roster the
    /// service returns; a valid decision without one is denied.
    pub async fn check(&self, request: &AccessRequest) -> AccessOutcome {
        let mut attempt = 0;
        let decision = loop {
            match self.validator.validate(request).await {
                Ok(decision) => break decision,
                Err(e) if e.is_transient() && attempt < self.transient_retries => {
                    attempt += 1;
                    warn!(
                        session_id = %request.session_id,
                        "Authorization check failed ({}), retrying ({}/{})",
                        e, attempt, self.transient_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    warn!(session_id = %request.session_id, "Authorization check failed: {}", e);
                    return AccessOutcome::denied(format!("authorization check failed: {}", e));
                }
            }
        };

        if !decision.is_valid {
            let reason = decision.message.unwrap_or_else(|| "access denied".to_string());
            info!(session_id = %request.session_id, participant_id = %request.participant_id, "Access denied: {}", reason);
            return AccessOutcome::Denied { reason };
        }

        let role = match &decision.session {
            Some(metadata) if metadata.session_id != request.session_id => {
                return AccessOutcome::denied("authorization returned a different session");
            }
            Some(metadata) if metadata.has_roster() => match metadata.role_of(&request.participant_id) {
                Some(role) => role,
                None => return AccessOutcome::denied("participant is not part of this session"),
            },
            // the claimed role is only a hint; without a roster nothing confirms it
            _ => {
                warn!(session_id = %request.session_id, "Authorization passed without a session roster");
                return AccessOutcome::denied("authorization did not confirm the participant's role");
            }
        };
        if role != request.claimed_role {
            warn!(
                participant_id = %request.participant_id,
                "Claimed role {} overridden by session metadata ({})",
                request.claimed_role, role
            );
        }

        let session = Session::new(request.session_id.clone(), role, request.participant_id.clone());
        info!(session_id = %session.session_id, participant_id = %session.participant_id, role = %role, "Access granted");
        AccessOutcome::Granted(AccessGrant {
            session,
            metadata: decision.session,
        })
    }

    pub fn notify_joined(&self, session: &Session) -> JoinHandle<()> {
        self.notify(PresenceRecord::new(session, PresenceEvent::Join))
    }

    pub fn notify_left(&self, session: &Session) -> JoinHandle<()> {
        self.notify(PresenceRecord::new(session, PresenceEvent::Leave))
    }

    fn notify(&self, record: PresenceRecord) -> JoinHandle<()> {
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            match telemetry.record(&record).await {
                Ok(()) => debug!("Recorded {:?} for {}", record.event, record.participant_id),
                Err(e) => warn!("Presence telemetry failed for {}: {}", record.participant_id, e),
            }
        })
    }
}
