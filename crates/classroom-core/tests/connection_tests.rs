//! Two participants negotiating over the relay

mod common;

use classroom_core::media::{DeviceKind, MediaError};
use classroom_core::peer::{CandidatePairStats, InboundVideoStats, SdpType, TransportError, TransportStats};
use classroom_core::recovery::RecoveryStatus;
use classroom_core::{ClassroomError, ClassroomEvent, ConnectionState, ErrorKind, QualityTier, Role};
use common::*;

#[tokio::test]
async fn test_student_and_teacher_connect() {
    let classroom = Classroom::new();
    let (mut teacher, mut student) = classroom.connected_pair().await;

    assert_eq!(classroom.offers_from(TEACHER), 1);
    assert_eq!(classroom.offers_from(STUDENT), 0);

    let teacher_link = teacher.session.link_snapshot().await.unwrap();
    assert_eq!(teacher_link.local_description.map(|d| d.sdp_type), Some(SdpType::Offer));
    assert!(teacher_link.has_remote_stream);
    assert_eq!(teacher_link.buffered_candidates, 0);
    let student_link = student.session.link_snapshot().await.unwrap();
    assert_eq!(student_link.local_description.map(|d| d.sdp_type), Some(SdpType::Answer));

    teacher
        .wait_event("teacher remote stream", |e| matches!(e, ClassroomEvent::RemoteStream { .. }))
        .await;
    student
        .wait_event("student remote stream", |e| matches!(e, ClassroomEvent::RemoteStream { .. }))
        .await;

    eventually("both seats recorded", || classroom.backend.present(&SESSION.into()).len() == 2).await;
    eventually("recovery to settle", || {
        teacher.session.recovery_state().status == RecoveryStatus::Connected
    })
    .await;
}

#[tokio::test]
async fn test_connection_passes_through_awaiting_media() {
    let classroom = Classroom::new();
    let (mut teacher, _student) = classroom.connected_pair().await;

    let states: Vec<ConnectionState> = teacher
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ClassroomEvent::ConnectionStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Negotiating,
            ConnectionState::AwaitingMedia,
            ConnectionState::Connected
        ]
    );
}

#[tokio::test]
async fn test_student_alone_waits_for_an_offer() {
    let classroom = Classroom::new();
    let student = classroom.join(STUDENT, Role::Student).await.unwrap();

    assert_eq!(student.session.connection_state(), ConnectionState::Negotiating);
    let link = student.session.link_snapshot().await.unwrap();
    assert!(link.remote_description.is_none());
    assert_eq!(classroom.net.transports_created(), 0);
    student.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_switch_device_moves_capture() {
    let classroom = Classroom::new();
    let (mut teacher, _student) = classroom.connected_pair().await;

    teacher.session.switch_device(DeviceKind::VideoInput, "usb-cam").await.unwrap();
    assert!(teacher.media.is_in_use("usb-cam"));
    assert!(!teacher.media.is_in_use("default-cam"));
    assert_eq!(teacher.media.release_count("default-cam"), 1);
    assert_eq!(
        teacher.session.devices().preferences().get(DeviceKind::VideoInput),
        Some("usb-cam")
    );
    assert_eq!(teacher.session.connection_state(), ConnectionState::Connected);

    teacher.drain_events();
    match teacher.session.switch_device(DeviceKind::VideoInput, "ghost-cam").await {
        Err(ClassroomError::Device(MediaError::DeviceNotFound { device_id })) => assert_eq!(device_id, "ghost-cam"),
        other => panic!("expected device not found, got {:?}", other.err()),
    }
    let event = teacher
        .wait_event("device error", |e| matches!(e, ClassroomEvent::Error { .. }))
        .await;
    assert!(matches!(event, ClassroomEvent::Error { kind: ErrorKind::Device, .. }));
    assert!(teacher.media.is_in_use("usb-cam"));
}

#[tokio::test(start_paused = true)]
async fn test_quality_sampling_survives_failed_read() {
    let classroom = Classroom::new();
    let (mut teacher, student) = classroom.connected_pair().await;

    classroom.net.set_stats(TransportStats {
        inbound_video: Some(InboundVideoStats {
            packets_received: 990,
            packets_lost: 10,
            jitter_seconds: 0.02,
        }),
        candidate_pair: Some(CandidatePairStats {
            current_round_trip_time_seconds: Some(0.15),
        }),
    });
    classroom.net.fail_next_stats(TransportError::Stats("busy".into()));

    eventually("both participants to be sampled", || {
        teacher.session.latest_quality().map(|s| s.tier) == Some(QualityTier::Good)
            && student.session.latest_quality().map(|s| s.tier) == Some(QualityTier::Good)
    })
    .await;

    let event = teacher
        .wait_event("quality event", |e| matches!(e, ClassroomEvent::QualityChanged { .. }))
        .await;
    if let ClassroomEvent::QualityChanged { sample, .. } = event {
        assert_eq!(sample.tier, QualityTier::Good);
    }
    assert_eq!(teacher.session.connection_state(), ConnectionState::Connected);
}
