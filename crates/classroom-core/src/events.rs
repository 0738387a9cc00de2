//! Events surfaced to the UI layer
//!
//! The six callbacks of [`ClassroomEventHandler`] are the entire surface the
//! surrounding UI is allowed to depend on. Handlers are registered on an
//! [`EventEmitter`] with an optional [`EventFilter`]; components inside the crate
//! listen on the emitter's broadcast channel instead.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use classroom_core::events::{ClassroomEventHandler, EventEmitter, EventSubscription};
//! use classroom_core::peer::ConnectionState;
//! use classroom_core::SessionId;
//! use std::sync::Arc;
//!
//! struct Banner;
//!
//! #[async_trait]
//! impl ClassroomEventHandler for Banner {
//!     async fn on_connection_state_change(
//!         &self,
//!         session_id: &SessionId,
//!         _previous: ConnectionState,
//!         state: ConnectionState,
//!     ) {
//!         println!("{}: {:?}", session_id, state);
//!     }
//! }
//!
//! let emitter = EventEmitter::new();
//! emitter.subscribe(EventSubscription::all_events(Arc::new(Banner)));
//! assert_eq!(emitter.subscription_count(), 1);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::ErrorKind;
use crate::media::{DisplaySurface, MediaStreamHandle, StopReason};
use crate::peer::ConnectionState;
use crate::quality::{QualitySample, QualityTier};
use crate::recovery::{RecoveryState, RecoveryStatus};
use crate::session::SessionId;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Priority levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Discriminant of [`ClassroomEvent`], used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RemoteStream,
    ConnectionStateChanged,
    Error,
    QualityChanged,
    RecoveryStateChanged,
    ScreenShareStateChanged,
}

/// Everything the session layer reports
#[derive(Debug, Clone)]
pub enum ClassroomEvent {
    RemoteStream {
        session_id: SessionId,
        stream: MediaStreamHandle,
    },
    ConnectionStateChanged {
        session_id: SessionId,
        previous: ConnectionState,
        state: ConnectionState,
        timestamp: DateTime<Utc>,
    },
    Error {
        session_id: SessionId,
        kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    QualityChanged {
        session_id: SessionId,
        sample: QualitySample,
    },
    RecoveryStateChanged {
        session_id: SessionId,
        state: RecoveryState,
    },
    ScreenShareStateChanged {
        session_id: SessionId,
        is_sharing: bool,
        surface: Option<DisplaySurface>,
        reason: Option<StopReason>,
    },
}

impl ClassroomEvent {
    pub fn connection_state(session_id: SessionId, previous: ConnectionState, state: ConnectionState) -> Self {
        ClassroomEvent::ConnectionStateChanged {
            session_id,
            previous,
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn error(session_id: SessionId, kind: ErrorKind, message: impl Into<String>) -> Self {
        ClassroomEvent::Error {
            session_id,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ClassroomEvent::RemoteStream { .. } => EventKind::RemoteStream,
            ClassroomEvent::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            ClassroomEvent::Error { .. } => EventKind::Error,
            ClassroomEvent::QualityChanged { .. } => EventKind::QualityChanged,
            ClassroomEvent::RecoveryStateChanged { .. } => EventKind::RecoveryStateChanged,
            ClassroomEvent::ScreenShareStateChanged { .. } => EventKind::ScreenShareStateChanged,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            ClassroomEvent::RemoteStream { session_id, .. }
            | ClassroomEvent::ConnectionStateChanged { session_id, .. }
            | ClassroomEvent::Error { session_id, .. }
            | ClassroomEvent::QualityChanged { session_id, .. }
            | ClassroomEvent::RecoveryStateChanged { session_id, .. }
            | ClassroomEvent::ScreenShareStateChanged { session_id, .. } => session_id,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            ClassroomEvent::Error { kind: ErrorKind::Authorization, .. } => EventPriority::Critical,
            ClassroomEvent::Error { .. } => EventPriority::High,
            ClassroomEvent::RemoteStream { .. } => EventPriority::High,
            ClassroomEvent::ConnectionStateChanged { state, .. } => match state {
                ConnectionState::Disconnected | ConnectionState::Closed => EventPriority::High,
                _ => EventPriority::Normal,
            },
            ClassroomEvent::RecoveryStateChanged { state, .. } if state.status == RecoveryStatus::Failed => {
                EventPriority::Critical
            }
            ClassroomEvent::RecoveryStateChanged { .. } => EventPriority::Normal,
            ClassroomEvent::QualityChanged { sample, .. } if sample.tier == QualityTier::Poor => EventPriority::Normal,
            ClassroomEvent::QualityChanged { .. } => EventPriority::Low,
            ClassroomEvent::ScreenShareStateChanged { .. } => EventPriority::Normal,
        }
    }
}

/// Event filter for selective handling
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only deliver these kinds (all kinds if None)
    pub kinds: Option<HashSet<EventKind>>,
    /// Minimum priority level
    pub min_priority: Option<EventPriority>,
    /// Only deliver events for these sessions (all sessions if None)
    pub session_ids: Option<HashSet<SessionId>>,
}

impl EventFilter {
    pub fn matches(&self, event: &ClassroomEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if event.priority() < min {
                return false;
            }
        }
        if let Some(sessions) = &self.session_ids {
            if !sessions.contains(event.session_id()) {
                return false;
            }
        }
        true
    }
}

/// UI callbacks; every method defaults to doing nothing
#[async_trait]
pub trait ClassroomEventHandler: Send + Sync {
    async fn on_remote_stream(&self, _session_id: &SessionId, _stream: MediaStreamHandle) {}

    async fn on_connection_state_change(
        &self,
        _session_id: &SessionId,
        _previous: ConnectionState,
        _state: ConnectionState,
    ) {
    }

    async fn on_error(&self, _session_id: &SessionId, _kind: ErrorKind, _message: &str) {}

    async fn on_quality_change(&self, _session_id: &SessionId, _sample: &QualitySample) {}

    async fn on_recovery_state_change(&self, _session_id: &SessionId, _state: &RecoveryState) {}

    async fn on_screen_share_state_change(
        &self,
        _session_id: &SessionId,
        _is_sharing: bool,
        _reason: Option<StopReason>,
    ) {
    }

    /// Route an event to the matching callback
    async fn on_event(&self, event: ClassroomEvent) {
        match event {
            ClassroomEvent::RemoteStream { session_id, stream } => {
                self.on_remote_stream(&session_id, stream).await
            }
            ClassroomEvent::ConnectionStateChanged { session_id, previous, state, .. } => {
                self.on_connection_state_change(&session_id, previous, state).await
            }
            ClassroomEvent::Error { session_id, kind, message, .. } => {
                self.on_error(&session_id, kind, &message).await
            }
            ClassroomEvent::QualityChanged { session_id, sample } => {
                self.on_quality_change(&session_id, &sample).await
            }
            ClassroomEvent::RecoveryStateChanged { session_id, state } => {
                self.on_recovery_state_change(&session_id, &state).await
            }
            ClassroomEvent::ScreenShareStateChanged { session_id, is_sharing, reason, .. } => {
                self.on_screen_share_state_change(&session_id, is_sharing, reason).await
            }
        }
    }
}

/// A handler plus the filter it was registered with
#[derive(Clone)]
pub struct EventSubscription {
    handler: Arc<dyn ClassroomEventHandler>,
    filter: EventFilter,
    id: uuid::Uuid,
}

impl EventSubscription {
    pub fn new(handler: Arc<dyn ClassroomEventHandler>, filter: EventFilter) -> Self {
        Self {
            handler,
            filter,
            id: uuid::Uuid::new_v4(),
        }
    }

    pub fn all_events(handler: Arc<dyn ClassroomEventHandler>) -> Self {
        Self::new(handler, EventFilter::default())
    }

    pub fn session_events(handler: Arc<dyn ClassroomEventHandler>, session_id: SessionId) -> Self {
        let mut sessions = HashSet::new();
        sessions.insert(session_id);
        Self::new(
            handler,
            EventFilter {
                session_ids: Some(sessions),
                ..Default::default()
            },
        )
    }

    pub fn high_priority_events(handler: Arc<dyn ClassroomEventHandler>) -> Self {
        Self::new(
            handler,
            EventFilter {
                min_priority: Some(EventPriority::High),
                ..Default::default()
            },
        )
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn should_receive(&self, event: &ClassroomEvent) -> bool {
        self.filter.matches(event)
    }
}

/// Fan-out point for [`ClassroomEvent`]s
///
/// Handlers are awaited in registration order, so a handler sees events in
/// the order they were emitted. Handlers must not wait on session operations.
pub struct EventEmitter {
    subscriptions: RwLock<Vec<EventSubscription>>,
    tx: broadcast::Sender<ClassroomEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Add an event subscription, returning its id
    pub fn subscribe(&self, subscription: EventSubscription) -> uuid::Uuid {
        let id = subscription.id();
        self.subscriptions.write().push(subscription);
        id
    }

    /// Remove an event subscription; `true` if it existed
    pub fn unsubscribe(&self, subscription_id: uuid::Uuid) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id() != subscription_id);
        subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Receiver for in-crate listeners
    pub fn listen(&self) -> broadcast::Receiver<ClassroomEvent> {
        self.tx.subscribe()
    }

    pub async fn emit(&self, event: ClassroomEvent) {
        trace!("Emitting {:?} for session {}", event.kind(), event.session_id());
        let _ = self.tx.send(event.clone());

        let targets: Vec<EventSubscription> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.should_receive(&event))
            .cloned()
            .collect();

        for subscription in targets {
            subscription.handler.on_event(event.clone()).await;
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ConnectionState>>,
        errors: Mutex<Vec<(ErrorKind, String)>>,
    }

    #[async_trait]
    impl ClassroomEventHandler for Recorder {
        async fn on_connection_state_change(&self, _session_id: &SessionId, _previous: ConnectionState, state: ConnectionState) {
            self.states.lock().push(state);
        }

        async fn on_error(&self, _session_id: &SessionId, kind: ErrorKind, message: &str) {
            self.errors.lock().push((kind, message.to_string()));
        }
    }

    fn sid() -> SessionId {
        SessionId::from("lesson-1")
    }

    #[tokio::test]
    async fn test_handlers_receive_in_order() {
        let emitter = EventEmitter::new();
        let recorder = Arc::new(Recorder::default());
        emitter.subscribe(EventSubscription::all_events(recorder.clone()));

        emitter
            .emit(ClassroomEvent::connection_state(sid(), ConnectionState::New, ConnectionState::Negotiating))
            .await;
        emitter
            .emit(ClassroomEvent::connection_state(sid(), ConnectionState::Negotiating, ConnectionState::Connected))
            .await;

        assert_eq!(
            *recorder.states.lock(),
            vec![ConnectionState::Negotiating, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_priority_filter() {
        let emitter = EventEmitter::new();
        let recorder = Arc::new(Recorder::default());
        emitter.subscribe(EventSubscription::high_priority_events(recorder.clone()));

        emitter
            .emit(ClassroomEvent::connection_state(sid(), ConnectionState::New, ConnectionState::Negotiating))
            .await;
        emitter
            .emit(ClassroomEvent::connection_state(sid(), ConnectionState::Connected, ConnectionState::Disconnected))
            .await;
        emitter.emit(ClassroomEvent::error(sid(), ErrorKind::Device, "camera unplugged")).await;

        assert_eq!(*recorder.states.lock(), vec![ConnectionState::Disconnected]);
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_session_filter_and_unsubscribe() {
        let emitter = EventEmitter::new();
        let recorder = Arc::new(Recorder::default());
        let id = emitter.subscribe(EventSubscription::session_events(recorder.clone(), sid()));

        emitter.emit(ClassroomEvent::error("other".into(), ErrorKind::Negotiation, "x")).await;
        emitter.emit(ClassroomEvent::error(sid(), ErrorKind::Negotiation, "y")).await;
        assert_eq!(recorder.errors.lock().len(), 1);

        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(ClassroomEvent::error(sid(), ErrorKind::Negotiation, "z")).await;
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_listeners_see_every_event() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.listen();

        emitter.emit(ClassroomEvent::error(sid(), ErrorKind::Transport, "ice failed")).await;

        match rx.recv().await.unwrap() {
            ClassroomEvent::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Transport);
                assert_eq!(message, "ice failed");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
