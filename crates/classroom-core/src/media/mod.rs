//! Local and remote media handles
//!
//! This module wraps platform capture behind the [`MediaSource`] capability so
//! the orchestrator and recovery logic never touch hardware directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────────┐
//! │  DeviceManager   │     │ ScreenShareController │
//! │ (camera + mic)   │     │   (display surface)   │
//! └────────┬─────────┘     └──────────┬───────────┘
//!          │  open_user_media          │ open_display_media
//!          ▼                           ▼
//! ┌─────────────────────────────────────────────────┐
//! │                  MediaSource                     │
//! │   MockMediaSource  |  CpalMediaSource (cpal)     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Every [`MediaStreamHandle`] is owned by the component that opened it and
//! must be stopped explicitly. Stopping a track releases its device exactly once.

pub mod device;
pub mod platform;
pub mod screen_share;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub use device::{DeviceManager, DevicePreferences, JsonFilePreferenceStore, MemoryPreferenceStore, PreferenceStore};
pub use platform::MockMediaSource;
pub use screen_share::{ScreenShareController, ScreenShareError, StopReason, StreamSink};

/// Errors raised while enumerating or opening capture devices
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Permission denied for {device}")]
    PermissionDenied { device: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("No {kind} source available")]
    NoSourceAvailable { kind: String },

    #[error("Device in use: {device_id}")]
    DeviceInUse { device_id: String },

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Preference store error: {0}")]
    Preferences(String),
}

/// Kind of capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::AudioInput => f.write_str("microphone"),
            DeviceKind::VideoInput => f.write_str("camera"),
        }
    }
}

/// Information about an available capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    pub is_default: bool,
}

/// Which device to open for one media kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    Default,
    Exact(String),
}

/// What to capture for a primary (camera + microphone) stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<DeviceSelection>,
    pub video: Option<DeviceSelection>,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: Some(DeviceSelection::Default),
            video: Some(DeviceSelection::Default),
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: Some(DeviceSelection::Default),
            video: None,
        }
    }
}

/// Display surface requested for screen sharing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplaySurface {
    Screen,
    Window,
}

impl fmt::Display for DisplaySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplaySurface::Screen => f.write_str("screen"),
            DisplaySurface::Window => f.write_str("window"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a stream's tracks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOrigin {
    Camera,
    Display,
    Remote,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    device_id: Option<String>,
    stopped: AtomicBool,
    ended_tx: watch::Sender<bool>,
    release: Mutex<Option<ReleaseHook>>,
}

/// One audio or video track
///
/// Clones share state: stopping any clone stops the track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, device_id: Option<String>) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                device_id,
                stopped: AtomicBool::new(false),
                ended_tx,
                release: Mutex::new(None),
            }),
        }
    }

    /// Install the hook that gives the underlying device back to the platform
    pub fn with_release(self, release: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.release.lock() = Some(Box::new(release));
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track; returns `false` when it was already stopped
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(release) = self.inner.release.lock().take() {
            release();
        }
        true
    }

    /// Called by the platform when capture ends outside our control
    /// (device unplugged, "stop sharing" in the native UI).
    pub fn end_from_source(&self) -> bool {
        let stopped_now = self.stop();
        self.inner.ended_tx.send_replace(true);
        stopped_now
    }

    /// Resolves once the platform ended the track
    pub async fn ended(&self) {
        let mut rx = self.inner.ended_tx.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("device_id", &self.inner.device_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug)]
struct StreamInner {
    id: String,
    origin: StreamOrigin,
    tracks: Vec<MediaTrack>,
}

/// Opaque handle to a capture or remote stream
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    inner: Arc<StreamInner>,
}

impl MediaStreamHandle {
    pub fn new(origin: StreamOrigin, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                origin,
                tracks,
            }),
        }
    }

    /// Stream received from the other participant
    pub fn remote(kinds: &[TrackKind]) -> Self {
        let tracks = kinds
            .iter()
            .map(|kind| MediaTrack::new(*kind, "remote", None))
            .collect();
        Self::new(StreamOrigin::Remote, tracks)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn origin(&self) -> StreamOrigin {
        self.inner.origin
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.inner.tracks
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.inner.tracks.iter().map(|t| t.kind()).collect()
    }

    pub fn has_video(&self) -> bool {
        self.inner.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// True while at least one track is live
    pub fn is_active(&self) -> bool {
        self.inner.tracks.iter().any(|t| !t.is_stopped())
    }

    /// Stop every track; returns how many were stopped by this call
    pub fn stop_all(&self) -> usize {
        self.inner.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Resolves when the platform ends any track of this stream
    pub async fn ended(&self) {
        let waits: Vec<_> = self.inner.tracks.iter().map(|t| Box::pin(t.ended())).collect();
        if waits.is_empty() {
            futures::future::pending::<()>().await;
        }
        futures::future::select_all(waits).await;
    }
}

impl PartialEq for MediaStreamHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Platform media capture capability
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// List capture devices currently present
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    /// Open camera and/or microphone
    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStreamHandle, MediaError>;

    /// Ask the user to pick a screen or window to capture
    async fn open_display_media(&self, surface: DisplaySurface) -> Result<MediaStreamHandle, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_track_stop_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let track = MediaTrack::new(TrackKind::Video, "cam", Some("cam-1".into())).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.clone().stop());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_stop_all_counts_new_stops() {
        let audio = MediaTrack::new(TrackKind::Audio, "mic", None);
        let video = MediaTrack::new(TrackKind::Video, "cam", None);
        audio.stop();
        let stream = MediaStreamHandle::new(StreamOrigin::Camera, vec![audio, video]);

        assert!(stream.is_active());
        assert_eq!(stream.stop_all(), 1);
        assert!(!stream.is_active());
        assert_eq!(stream.stop_all(), 0);
    }

    #[tokio::test]
    async fn test_ended_fires_only_for_source_end() {
        let track = MediaTrack::new(TrackKind::Video, "display", None);
        let stream = MediaStreamHandle::new(StreamOrigin::Display, vec![track.clone()]);

        let waiter = tokio::spawn({
            let stream = stream.clone();
            async move { stream.ended().await }
        });

        track.stop();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        track.end_from_source();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
