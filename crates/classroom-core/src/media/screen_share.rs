//! Screen sharing as a secondary stream
//!
//! A display capture lives next to the camera stream and is attached to the
//! peer link without changing its connection state. Stopping through
//! [`ScreenShareController::stop_screen_share`] and the user ending the capture
//! from the platform UI both run the same cleanup routine.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DisplaySurface, MediaError, MediaSource, MediaStreamHandle};
use crate::error::ErrorKind;
use crate::events::{ClassroomEvent, EventEmitter};
use crate::peer::TransportError;
use crate::session::SessionId;

/// Why a screen share ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// `stop_screen_share` was called
    User,
    /// The capture was ended from the platform's own UI
    NativeUi,
    /// The session is being torn down
    Teardown,
}

/// Screen share failures, kept apart so the UI can show a precise message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScreenShareError {
    #[error("Permission to capture the display was denied")]
    PermissionDenied,

    #[error("No screen or window is available to share")]
    NoSourceAvailable,

    #[error("A screen share is already active")]
    AlreadySharing,

    #[error("Failed to attach screen share to the session: {0}")]
    Attach(String),

    #[error("Screen share failed: {0}")]
    Other(String),
}

impl From<MediaError> for ScreenShareError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied { .. } => ScreenShareError::PermissionDenied,
            MediaError::NoSourceAvailable { .. } | MediaError::DeviceNotFound { .. } => {
                ScreenShareError::NoSourceAvailable
            }
            other => ScreenShareError::Other(other.to_string()),
        }
    }
}

/// Where a secondary stream is attached for sending
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn attach_secondary(&self, stream: MediaStreamHandle) -> Result<(), TransportError>;
    async fn detach_secondary(&self, stream_id: &str) -> Result<(), TransportError>;
}

struct ActiveShare {
    stream: MediaStreamHandle,
    surface: DisplaySurface,
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    session_id: SessionId,
    source: Arc<dyn MediaSource>,
    sink: Option<Arc<dyn StreamSink>>,
    emitter: Arc<EventEmitter>,
    active: Mutex<Option<ActiveShare>>,
    // serializes start and cleanup
    op_lock: tokio::sync::Mutex<()>,
}

/// Owner of the display capture stream
#[derive(Clone)]
pub struct ScreenShareController {
    inner: Arc<Inner>,
}

impl ScreenShareController {
    pub fn new(
        session_id: SessionId,
        source: Arc<dyn MediaSource>,
        sink: Option<Arc<dyn StreamSink>>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id,
                source,
                sink,
                emitter,
                active: Mutex::new(None),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    pub fn current_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.active.lock().as_ref().map(|share| share.stream.clone())
    }

    /// Capture a screen or window and attach it to the session
    pub async fn start_screen_share(&self, surface: DisplaySurface) -> Result<MediaStreamHandle, ScreenShareError> {
        let guard = self.inner.op_lock.lock().await;
        if self.is_sharing() {
            return Err(ScreenShareError::AlreadySharing);
        }

        let stream = match self.inner.source.open_display_media(surface).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = ScreenShareError::from(e);
                drop(guard);
                self.report(&err).await;
                return Err(err);
            }
        };

        if let Some(sink) = &self.inner.sink {
            if let Err(e) = sink.attach_secondary(stream.clone()).await {
                stream.stop_all();
                let err = ScreenShareError::Attach(e.to_string());
                drop(guard);
                self.report(&err).await;
                return Err(err);
            }
        }

        *self.inner.active.lock() = Some(ActiveShare {
            stream: stream.clone(),
            surface,
            watcher: None,
        });

        let watcher = {
            let inner = self.inner.clone();
            let watched = stream.clone();
            tokio::spawn(async move {
                watched.ended().await;
                debug!("Display capture {} ended from the platform", watched.id());
                Inner::cleanup(&inner, StopReason::NativeUi, Some(watched.id())).await;
            })
        };
        if let Some(share) = self.inner.active.lock().as_mut() {
            share.watcher = Some(watcher);
        }
        drop(guard);

        info!(session_id = %self.inner.session_id, "Screen share started ({})", surface);
        self.inner
            .emitter
            .emit(ClassroomEvent::ScreenShareStateChanged {
                session_id: self.inner.session_id.clone(),
                is_sharing: true,
                surface: Some(surface),
                reason: None,
            })
            .await;
        Ok(stream)
    }

    /// Stop sharing; returns `false` if nothing was being shared
    pub async fn stop_screen_share(&self) -> bool {
        Inner::cleanup(&self.inner, StopReason::User, None).await
    }

    /// Stop sharing as part of session teardown
    pub async fn shutdown(&self) -> bool {
        Inner::cleanup(&self.inner, StopReason::Teardown, None).await
    }

    async fn report(&self, err: &ScreenShareError) {
        warn!(session_id = %self.inner.session_id, "Screen share failed: {}", err);
        self.inner
            .emitter
            .emit(ClassroomEvent::error(
                self.inner.session_id.clone(),
                ErrorKind::ScreenShare,
                err.to_string(),
            ))
            .await;
    }
}

impl Inner {
    /// Single cleanup path for every way a share can end
    ///
    /// `ended_stream` is set when the watcher of that stream is the caller; a
    /// watcher never tears down a newer share.
    async fn cleanup(inner: &Arc<Inner>, reason: StopReason, ended_stream: Option<&str>) -> bool {
        let guard = inner.op_lock.lock().await;

        let share = {
            let mut active = inner.active.lock();
            match (active.as_ref(), ended_stream) {
                (None, _) => return false,
                (Some(share), Some(id)) if share.stream.id() != id => return false,
                _ => {}
            }
            active.take()
        };
        let Some(share) = share else {
            return false;
        };

        if ended_stream.is_none() {
            if let Some(watcher) = &share.watcher {
                watcher.abort();
            }
        }

        let stopped = share.stream.stop_all();
        if let Some(sink) = &inner.sink {
            if let Err(e) = sink.detach_secondary(share.stream.id()).await {
                warn!("Failed to detach screen share {}: {}", share.stream.id(), e);
            }
        }
        drop(guard);

        info!(
            session_id = %inner.session_id,
            "Screen share stopped ({:?}, {} tracks stopped)", reason, stopped
        );
        inner
            .emitter
            .emit(ClassroomEvent::ScreenShareStateChanged {
                session_id: inner.session_id.clone(),
                is_sharing: false,
                surface: Some(share.surface),
                reason: Some(reason),
            })
            .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MockMediaSource;

    #[test]
    fn test_media_errors_map_to_share_errors() {
        assert_eq!(
            ScreenShareError::from(MediaError::PermissionDenied { device: "display".into() }),
            ScreenShareError::PermissionDenied
        );
        assert_eq!(
            ScreenShareError::from(MediaError::NoSourceAvailable { kind: "display".into() }),
            ScreenShareError::NoSourceAvailable
        );
        assert!(matches!(
            ScreenShareError::from(MediaError::Platform("boom".into())),
            ScreenShareError::Other(_)
        ));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let source = MockMediaSource::new();
        let controller = ScreenShareController::new(
            "lesson".into(),
            Arc::new(source.clone()),
            None,
            Arc::new(EventEmitter::new()),
        );

        controller.start_screen_share(DisplaySurface::Screen).await.unwrap();
        assert_eq!(
            controller.start_screen_share(DisplaySurface::Window).await.unwrap_err(),
            ScreenShareError::AlreadySharing
        );
        assert!(!source.is_in_use("display:window"));
        assert!(controller.stop_screen_share().await);
        assert!(!controller.stop_screen_share().await);
    }
}
