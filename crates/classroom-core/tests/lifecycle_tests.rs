//! Leaving a classroom

mod common;

use classroom_core::access::PresenceEvent;
use classroom_core::media::DisplaySurface;
use classroom_core::{ClassroomError, ConnectionState, ParticipantId};
use common::*;

#[tokio::test]
async fn test_leave_releases_everything_once() {
    let classroom = Classroom::new();
    let (teacher, student) = classroom.connected_pair().await;
    teacher.session.start_screen_share(DisplaySurface::Screen).await.unwrap();

    teacher.session.leave().await.unwrap();

    assert!(teacher.media.devices_in_use().is_empty());
    for device in ["default-cam", "default-mic", "display:screen"] {
        assert_eq!(teacher.media.release_count(device), 1, "{}", device);
    }
    assert_eq!(teacher.session.connection_state(), ConnectionState::Closed);
    wait_for_state(&student, ConnectionState::Disconnected).await;
    eventually("relay unsubscribe", || classroom.relay.subscriber_count(&SESSION.into()) == 1).await;

    assert_eq!(classroom.backend.present(&SESSION.into()), vec![ParticipantId::from(STUDENT)]);
    let last = classroom.backend.records().last().cloned().unwrap();
    assert_eq!(last.participant_id, ParticipantId::from(TEACHER));
    assert_eq!(last.event, PresenceEvent::Leave);

    teacher.session.leave().await.unwrap();
    assert_eq!(teacher.media.release_count("default-cam"), 1);
    assert_eq!(classroom.backend.records().len(), 3);
    assert!(matches!(
        teacher.session.start_screen_share(DisplaySurface::Screen).await,
        Err(ClassroomError::SessionClosed)
    ));
    assert!(matches!(teacher.session.retry().await, Err(ClassroomError::SessionClosed)));
}

#[tokio::test]
async fn test_both_leave() {
    let classroom = Classroom::new();
    let (teacher, student) = classroom.connected_pair().await;

    student.session.leave().await.unwrap();
    teacher.session.leave().await.unwrap();

    assert!(classroom.backend.present(&SESSION.into()).is_empty());
    assert_eq!(classroom.net.linked_count(), 0);
    eventually("relay unsubscribe", || classroom.relay.subscriber_count(&SESSION.into()) == 0).await;
}
