//! Camera and microphone selection
//!
//! The [`DeviceManager`] owns the primary capture stream. It remembers the
//! user's chosen devices through a [`PreferenceStore`] and falls back to the
//! platform default when a remembered device has disappeared.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DeviceInfo, DeviceKind, DeviceSelection, MediaConstraints, MediaError, MediaSource, MediaStreamHandle};
use crate::config::DeviceConfig;

/// Devices the user picked last time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePreferences {
    pub audio_input: Option<String>,
    pub video_input: Option<String>,
}

impl DevicePreferences {
    pub fn get(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::AudioInput => self.audio_input.as_deref(),
            DeviceKind::VideoInput => self.video_input.as_deref(),
        }
    }

    pub fn set(&mut self, kind: DeviceKind, device_id: Option<String>) {
        match kind {
            DeviceKind::AudioInput => self.audio_input = device_id,
            DeviceKind::VideoInput => self.video_input = device_id,
        }
    }
}

/// Persistence for [`DevicePreferences`]
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn load(&self) -> Result<DevicePreferences, MediaError>;
    async fn save(&self, preferences: &DevicePreferences) -> Result<(), MediaError>;
}

/// Keeps preferences for the lifetime of the process
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    preferences: Mutex<DevicePreferences>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preferences(preferences: DevicePreferences) -> Self {
        Self {
            preferences: Mutex::new(preferences),
        }
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn load(&self) -> Result<DevicePreferences, MediaError> {
        Ok(self.preferences.lock().clone())
    }

    async fn save(&self, preferences: &DevicePreferences) -> Result<(), MediaError> {
        *self.preferences.lock() = preferences.clone();
        Ok(())
    }
}

/// Stores preferences as a small JSON document
#[derive(Debug, Clone)]
pub struct JsonFilePreferenceStore {
    path: PathBuf,
}

impl JsonFilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PreferenceStore for JsonFilePreferenceStore {
    async fn load(&self) -> Result<DevicePreferences, MediaError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DevicePreferences::default()),
            Err(e) => return Err(MediaError::Preferences(format!("{}: {}", self.path.display(), e))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| MediaError::Preferences(format!("{}: {}", self.path.display(), e)))
    }

    async fn save(&self, preferences: &DevicePreferences) -> Result<(), MediaError> {
        let json = serde_json::to_vec_pretty(preferences).map_err(|e| MediaError::Preferences(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| MediaError::Preferences(e.to_string()))?;
            }
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| MediaError::Preferences(format!("{}: {}", self.path.display(), e)))
    }
}

/// Owner of the primary (camera + microphone) stream
pub struct DeviceManager {
    source: Arc<dyn MediaSource>,
    store: Arc<dyn PreferenceStore>,
    preferences: RwLock<DevicePreferences>,
    active: Mutex<Option<MediaStreamHandle>>,
    capture_audio: bool,
    capture_video: bool,
}

impl DeviceManager {
    /// Create a manager and load remembered preferences
    ///
    /// An unreadable preference store is logged and treated as empty.
    pub async fn load(
        source: Arc<dyn MediaSource>,
        store: Arc<dyn PreferenceStore>,
        config: &DeviceConfig,
    ) -> Self {
        let preferences = match store.load().await {
            Ok(preferences) => preferences,
            Err(e) => {
                warn!("Ignoring unreadable device preferences: {}", e);
                DevicePreferences::default()
            }
        };

        Self {
            source,
            store,
            preferences: RwLock::new(preferences),
            active: Mutex::new(None),
            capture_audio: config.capture_audio,
            capture_video: config.capture_video,
        }
    }

    pub fn source(&self) -> Arc<dyn MediaSource> {
        self.source.clone()
    }

    pub async fn list_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, MediaError> {
        let devices = self.source.enumerate_devices().await?;
        Ok(devices.into_iter().filter(|d| d.kind == kind).collect())
    }

    /// Remember a device for future captures
    pub async fn select_device(&self, kind: DeviceKind, device_id: &str) -> Result<(), MediaError> {
        let known = self.list_devices(kind).await?;
        if !known.iter().any(|d| d.id == device_id) {
            return Err(MediaError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }

        let updated = {
            let mut preferences = self.preferences.write();
            preferences.set(kind, Some(device_id.to_string()));
            preferences.clone()
        };
        self.store.save(&updated).await?;
        info!("Selected {} {}", kind, device_id);
        Ok(())
    }

    pub fn preferences(&self) -> DevicePreferences {
        self.preferences.read().clone()
    }

    /// Open the primary capture stream
    ///
    /// Any stream held from an earlier call is stopped first so the same
    /// physical device is never owned twice.
    pub async fn acquire_local_stream(&self) -> Result<MediaStreamHandle, MediaError> {
        self.release();

        let devices = self.source.enumerate_devices().await?;
        let preferences = self.preferences();
        let constraints = MediaConstraints {
            audio: self
                .capture_audio
                .then(|| Self::selection(DeviceKind::AudioInput, preferences.get(DeviceKind::AudioInput), &devices)),
            video: self
                .capture_video
                .then(|| Self::selection(DeviceKind::VideoInput, preferences.get(DeviceKind::VideoInput), &devices)),
        };

        let stream = self.source.open_user_media(&constraints).await?;
        debug!("Acquired local stream {} with {} tracks", stream.id(), stream.tracks().len());
        *self.active.lock() = Some(stream.clone());
        Ok(stream)
    }

    /// Stop the primary stream; returns how many tracks were stopped
    pub fn release(&self) -> usize {
        match self.active.lock().take() {
            Some(stream) => {
                let stopped = stream.stop_all();
                debug!("Released local stream {} ({} tracks)", stream.id(), stopped);
                stopped
            }
            None => 0,
        }
    }

    pub fn active_stream(&self) -> Option<MediaStreamHandle> {
        self.active.lock().clone()
    }

    fn selection(kind: DeviceKind, preferred: Option<&str>, devices: &[DeviceInfo]) -> DeviceSelection {
        match preferred {
            Some(id) if devices.iter().any(|d| d.kind == kind && d.id == id) => DeviceSelection::Exact(id.to_string()),
            Some(id) => {
                warn!("Remembered {} {} is no longer present, using the default", kind, id);
                DeviceSelection::Default
            }
            None => DeviceSelection::Default,
        }
    }
}
