//! One participant's classroom session
//!
//! [`ClassroomSession::join`] runs the access check, acquires media, starts
//! negotiating and wires connection health into recovery. Every other
//! component is owned here and torn down by [`ClassroomSession::leave`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::{
    AccessGuard, AccessOutcome, AccessRequest, AccessValidator, PresenceTelemetry, SessionMetadata,
};
use crate::config::ClassroomConfig;
use crate::error::{ClassroomError, ClassroomResult, ErrorKind};
use crate::events::{ClassroomEvent, EventEmitter};
use crate::media::{
    DeviceKind, DeviceManager, DisplaySurface, MediaError, MediaSource, MediaStreamHandle, PreferenceStore,
    ScreenShareController,
};
use crate::orchestrator::{OrchestratorHandle, SessionOrchestrator};
use crate::peer::link::PeerLinkSnapshot;
use crate::peer::{ConnectionState, TransportFactory};
use crate::quality::{QualityMonitor, QualitySample};
use crate::recovery::{RecoveryController, RecoveryState};
use crate::relay::RelayChannel;
use crate::session::{ParticipantId, Role, Session, SessionId};

/// External capabilities a session runs against
///
/// The emitter belongs to one participant; give each participant its own.
#[derive(Clone)]
pub struct ClassroomDeps {
    pub validator: Arc<dyn AccessValidator>,
    pub telemetry: Arc<dyn PresenceTelemetry>,
    pub media: Arc<dyn MediaSource>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub relay: Arc<dyn RelayChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub emitter: Arc<EventEmitter>,
}

/// Who wants to enter which session
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub claimed_role: Role,
}

impl JoinRequest {
    pub fn new(session_id: impl Into<SessionId>, participant_id: impl Into<ParticipantId>, claimed_role: Role) -> Self {
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            claimed_role,
        }
    }
}

pub struct ClassroomSession {
    session: Session,
    metadata: Option<SessionMetadata>,
    guard: AccessGuard,
    devices: Arc<DeviceManager>,
    orchestrator: OrchestratorHandle,
    screen_share: ScreenShareController,
    quality: QualityMonitor,
    recovery: RecoveryController,
    wiring: Mutex<Option<JoinHandle<()>>>,
    joined_notice: Mutex<Option<JoinHandle<()>>>,
    emitter: Arc<EventEmitter>,
    left: AtomicBool,
}

impl ClassroomSession {
    /// Enter a classroom
    ///
    /// Nothing is negotiated for a participant the access guard turns away.
    /// A negotiation failure after media is up does not fail the join; it is
    /// reported as an event and handed to recovery.
    ///
    /// ```
    /// use classroom_core::access::InMemoryClassroomBackend;
    /// use classroom_core::media::{MemoryPreferenceStore, MockMediaSource};
    /// use classroom_core::{
    ///     ClassroomConfig, ClassroomDeps, ClassroomSession, ConnectionState, EventEmitter, InMemoryRelay,
    ///     JoinRequest, LoopbackNetwork, Role,
    /// };
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let backend = InMemoryClassroomBackend::new();
    /// backend.schedule_lesson("lesson-42", "tea-1", "stu-1");
    /// let deps = ClassroomDeps {
    ///     validator: Arc::new(backend.clone()),
    ///     telemetry: Arc::new(backend.clone()),
    ///     media: Arc::new(MockMediaSource::new()),
    ///     preferences: Arc::new(MemoryPreferenceStore::new()),
    ///     relay: Arc::new(InMemoryRelay::new()),
    ///     transports: Arc::new(LoopbackNetwork::new().factory()),
    ///     emitter: Arc::new(EventEmitter::new()),
    /// };
    /// let request = JoinRequest::new("lesson-42", "stu-1", Role::Student);
    /// let student = ClassroomSession::join(&ClassroomConfig::default(), deps, request).await.unwrap();
    ///
    /// // nobody has offered yet
    /// assert_eq!(student.connection_state(), ConnectionState::Negotiating);
    /// student.leave().await.unwrap();
    /// # });
    /// ```
    pub async fn join(config: &ClassroomConfig, deps: ClassroomDeps, request: JoinRequest) -> ClassroomResult<Self> {
        config.validate()?;
        let emitter = deps.emitter.clone();

        let guard = AccessGuard::new(deps.validator.clone(), deps.telemetry.clone(), &config.access);
        let access_request = AccessRequest::new(
            request.session_id.clone(),
            request.participant_id.clone(),
            request.claimed_role,
        );
        let grant = match guard.check(&access_request).await {
            AccessOutcome::Granted(grant) => grant,
            AccessOutcome::Denied { reason } => {
                emitter
                    .emit(ClassroomEvent::error(request.session_id.clone(), ErrorKind::Authorization, reason.clone()))
                    .await;
                return Err(ClassroomError::AccessDenied { reason });
            }
        };
        let session = grant.session;
        let joined_notice = guard.notify_joined(&session);

        let devices = Arc::new(DeviceManager::load(deps.media.clone(), deps.preferences.clone(), &config.devices).await);
        let local = match devices.acquire_local_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                report_device_error(&emitter, &session.session_id, &e).await;
                let _ = joined_notice.await;
                let _ = guard.notify_left(&session).await;
                return Err(ClassroomError::Device(e));
            }
        };

        // subscribe before anything can be emitted
        let events = emitter.listen();
        let orchestrator = match SessionOrchestrator::spawn(
            session.clone(),
            &config.negotiation,
            deps.relay.clone(),
            deps.transports.clone(),
            emitter.clone(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id = %session.session_id, "Failed to start the orchestrator: {}", e);
                devices.release();
                let _ = joined_notice.await;
                let _ = guard.notify_left(&session).await;
                return Err(e);
            }
        };

        let recovery = RecoveryController::new(
            session.session_id.clone(),
            config.recovery.policy(),
            Arc::new(orchestrator.clone()),
            emitter.clone(),
        );
        let wiring = tokio::spawn(wire_recovery(session.session_id.clone(), events, recovery.clone()));
        let quality = QualityMonitor::start(
            session.session_id.clone(),
            Arc::new(orchestrator.clone()),
            &config.quality,
            emitter.clone(),
        );
        let screen_share = ScreenShareController::new(
            session.session_id.clone(),
            deps.media.clone(),
            Some(Arc::new(orchestrator.clone())),
            emitter.clone(),
        );

        if let Err(e) = orchestrator.start(local).await {
            debug!("Initial negotiation step failed: {}", e);
        }
        info!(
            session_id = %session.session_id,
            participant_id = %session.participant_id,
            role = %session.role,
            "Joined classroom"
        );

        Ok(Self {
            session,
            metadata: grant.metadata,
            guard,
            devices,
            orchestrator,
            screen_share,
            quality,
            recovery,
            wiring: Mutex::new(Some(wiring)),
            joined_notice: Mutex::new(Some(joined_notice)),
            emitter,
            left: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Scheduling details returned by the authorization check, if any
    pub fn metadata(&self) -> Option<&SessionMetadata> {
        self.metadata.as_ref()
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.orchestrator.state()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn latest_quality(&self) -> Option<QualitySample> {
        self.quality.latest()
    }

    pub async fn link_snapshot(&self) -> ClassroomResult<PeerLinkSnapshot> {
        self.orchestrator.snapshot().await
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen_share.is_sharing()
    }

    pub async fn start_screen_share(&self, surface: DisplaySurface) -> ClassroomResult<MediaStreamHandle> {
        self.ensure_active()?;
        Ok(self.screen_share.start_screen_share(surface).await?)
    }

    /// Returns `false` if nothing was being shared
    pub async fn stop_screen_share(&self) -> bool {
        self.screen_share.stop_screen_share().await
    }

    /// Remember `device_id` and move the live session onto it
    pub async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> ClassroomResult<()> {
        self.ensure_active()?;
        if let Err(e) = self.devices.select_device(kind, device_id).await {
            report_device_error(&self.emitter, &self.session.session_id, &e).await;
            return Err(e.into());
        }
        let stream = match self.devices.acquire_local_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                report_device_error(&self.emitter, &self.session.session_id, &e).await;
                return Err(e.into());
            }
        };
        self.orchestrator.replace_primary_stream(stream).await
    }

    /// User-initiated reconnect; starts a fresh episode even after failure
    pub async fn retry(&self) -> ClassroomResult<RecoveryState> {
        self.ensure_active()?;
        Ok(self.recovery.manual_retry().await)
    }

    /// Leave the classroom; calling it again does nothing
    pub async fn leave(&self) -> ClassroomResult<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session_id = %self.session.session_id, participant_id = %self.session.participant_id, "Leaving classroom");

        self.screen_share.shutdown().await;
        let released = self.devices.release();
        debug!("Released {} local tracks", released);

        self.quality.stop();
        self.recovery.shutdown();
        if let Some(wiring) = self.wiring.lock().take() {
            wiring.abort();
        }

        // closes the transport first, then drops the relay subscription
        self.orchestrator.close().await?;

        let joined_notice = self.joined_notice.lock().take();
        if let Some(notice) = joined_notice {
            let _ = notice.await;
        }
        let _ = self.guard.notify_left(&self.session).await;
        Ok(())
    }

    fn ensure_active(&self) -> ClassroomResult<()> {
        if self.left.load(Ordering::SeqCst) {
            Err(ClassroomError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for ClassroomSession {
    fn drop(&mut self) {
        if self.left.load(Ordering::SeqCst) {
            return;
        }
        warn!(session_id = %self.session.session_id, "Classroom session dropped without leave()");
        if let Some(wiring) = self.wiring.lock().take() {
            wiring.abort();
        }
        self.recovery.shutdown();
        self.quality.stop();
        self.devices.release();
    }
}

async fn report_device_error(emitter: &EventEmitter, session_id: &SessionId, err: &MediaError) {
    warn!(session_id = %session_id, "Device error: {}", err);
    emitter
        .emit(ClassroomEvent::error(session_id.clone(), ErrorKind::Device, err.to_string()))
        .await;
}

/// Feed link health into the recovery controller
async fn wire_recovery(
    session_id: SessionId,
    mut events: broadcast::Receiver<ClassroomEvent>,
    recovery: RecoveryController,
) {
    loop {
        match events.recv().await {
            Ok(ClassroomEvent::ConnectionStateChanged { session_id: sid, state, .. }) if sid == session_id => {
                match state {
                    ConnectionState::Connected => recovery.observe(true, None).await,
                    ConnectionState::Disconnected => {
                        recovery.observe(false, Some("connection lost".to_string())).await
                    }
                    _ => {}
                }
            }
            Ok(ClassroomEvent::Error {
                session_id: sid,
                kind,
                message,
                ..
            }) if sid == session_id && kind.triggers_recovery() => recovery.observe(false, Some(message)).await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Recovery wiring lagged behind by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
