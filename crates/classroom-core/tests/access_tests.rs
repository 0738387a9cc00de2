//! Admission into a classroom
//!
//! These tests verify:
//! - Participants outside the schedule never touch media, relay or transport
//! - A participant holds at most one seat until it leaves
//! - The scheduled role wins over the claimed one
//! - A capture failure aborts the join and releases the seat

mod common;

use classroom_core::access::PresenceEvent;
use classroom_core::media::{MediaError, MockMediaSource};
use classroom_core::{
    ClassroomError, ClassroomEvent, ClassroomSession, ConnectionState, ErrorKind, EventEmitter, JoinRequest,
    ParticipantId, Role, SessionId,
};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_unscheduled_participant_never_reaches_negotiation() {
    let classroom = Classroom::new();
    let media = MockMediaSource::new();
    let emitter = Arc::new(EventEmitter::new());
    let mut events = emitter.listen();

    let result = ClassroomSession::join(
        &classroom.config,
        classroom.deps(&media, emitter),
        JoinRequest::new(SESSION, "intruder", Role::Student),
    )
    .await;

    match result {
        Err(ClassroomError::AccessDenied { reason }) => assert_eq!(reason, "not a participant of this session"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("intruder was admitted"),
    }
    match events.try_recv() {
        Ok(ClassroomEvent::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Authorization),
        other => panic!("expected an authorization error event, got {:?}", other),
    }

    assert_eq!(classroom.net.transports_created(), 0);
    assert!(classroom.relay.published().is_empty());
    assert_eq!(classroom.relay.subscriber_count(&SessionId::from(SESSION)), 0);
    assert_eq!(media.open_count("default-cam"), 0);
    assert!(classroom.backend.records().is_empty());
}

#[tokio::test]
async fn test_participant_holds_one_seat_until_leaving() {
    let classroom = Classroom::new();
    let student = classroom.join(STUDENT, Role::Student).await.unwrap();
    eventually("join to be recorded", || {
        classroom.backend.present(&SESSION.into()) == vec![ParticipantId::from(STUDENT)]
    })
    .await;

    match classroom.join(STUDENT, Role::Student).await {
        Err(ClassroomError::AccessDenied { reason }) => assert_eq!(reason, "participant already joined"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("second seat granted"),
    }

    student.session.leave().await.unwrap();
    assert!(classroom.backend.present(&SESSION.into()).is_empty());

    let again = classroom.join(STUDENT, Role::Student).await.unwrap();
    assert_eq!(again.session.connection_state(), ConnectionState::Negotiating);
    again.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_scheduled_role_overrides_claim() {
    let classroom = Classroom::new();
    let teacher = classroom.join(TEACHER, Role::Student).await.unwrap();

    assert_eq!(teacher.session.session().role, Role::Teacher);
    assert!(teacher.session.metadata().is_some());
    eventually("offer to be published", || classroom.offers_from(TEACHER) == 1).await;
    teacher.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_capture_failure_aborts_join() {
    let classroom = Classroom::new();
    let media = MockMediaSource::new();
    media.fail_user_media(Some(MediaError::PermissionDenied {
        device: "camera".into(),
    }));

    match classroom.join_with(STUDENT, Role::Student, media.clone()).await {
        Err(ClassroomError::Device(MediaError::PermissionDenied { device })) => assert_eq!(device, "camera"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("joined without media"),
    }

    assert_eq!(classroom.net.transports_created(), 0);
    assert_eq!(classroom.relay.subscriber_count(&SESSION.into()), 0);
    let events: Vec<PresenceEvent> = classroom.backend.records().iter().map(|r| r.event).collect();
    assert_eq!(events, vec![PresenceEvent::Join, PresenceEvent::Leave]);
}
