//! In-memory media source for tests and simulation
//!
//! Devices are plain records. Opening a device marks it in use until every
//! track that holds it has been stopped, which lets tests assert that capture
//! hardware was released exactly once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::media::{
    DeviceInfo, DeviceKind, DeviceSelection, DisplaySurface, MediaConstraints, MediaError,
    MediaSource, MediaStreamHandle, MediaTrack, StreamOrigin, TrackKind,
};

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceInfo>,
    in_use: HashSet<String>,
    opened: HashMap<String, usize>,
    released: HashMap<String, usize>,
    user_media_failure: Option<MediaError>,
    display_failure: Option<MediaError>,
    display_tracks: Vec<MediaTrack>,
}

/// Fake capture hardware
#[derive(Clone)]
pub struct MockMediaSource {
    state: Arc<Mutex<MockState>>,
}

impl MockMediaSource {
    /// A source with a default and a USB device of each kind
    pub fn new() -> Self {
        Self::with_devices(vec![
            device("default-mic", "Built-in Microphone", DeviceKind::AudioInput, true),
            device("usb-mic", "USB Microphone", DeviceKind::AudioInput, false),
            device("default-cam", "Built-in Camera", DeviceKind::VideoInput, true),
            device("usb-cam", "USB Camera", DeviceKind::VideoInput, false),
        ])
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                devices,
                ..Default::default()
            })),
        }
    }

    pub fn add_device(&self, info: DeviceInfo) {
        self.state.lock().devices.push(info);
    }

    /// Simulate unplugging a device
    pub fn remove_device(&self, device_id: &str) {
        self.state.lock().devices.retain(|d| d.id != device_id);
    }

    /// Make every `open_user_media` call fail until cleared
    pub fn fail_user_media(&self, error: Option<MediaError>) {
        self.state.lock().user_media_failure = error;
    }

    /// Make every `open_display_media` call fail until cleared
    pub fn fail_display_media(&self, error: Option<MediaError>) {
        self.state.lock().display_failure = error;
    }

    pub fn is_in_use(&self, device_id: &str) -> bool {
        self.state.lock().in_use.contains(device_id)
    }

    pub fn devices_in_use(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().in_use.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn open_count(&self, device_id: &str) -> usize {
        self.state.lock().opened.get(device_id).copied().unwrap_or(0)
    }

    pub fn release_count(&self, device_id: &str) -> usize {
        self.state.lock().released.get(device_id).copied().unwrap_or(0)
    }

    /// Simulate the user pressing "stop sharing" in the native UI
    ///
    /// Returns `false` when no display capture is live.
    pub fn simulate_native_stop(&self) -> bool {
        let tracks: Vec<MediaTrack> = self.state.lock().display_tracks.drain(..).collect();
        let mut ended = false;
        for track in tracks {
            ended |= track.end_from_source();
        }
        ended
    }

    fn resolve(
        state: &MockState,
        kind: DeviceKind,
        selection: &DeviceSelection,
    ) -> Result<DeviceInfo, MediaError> {
        let found = match selection {
            DeviceSelection::Exact(id) => {
                return state
                    .devices
                    .iter()
                    .find(|d| d.kind == kind && &d.id == id)
                    .cloned()
                    .ok_or_else(|| MediaError::DeviceNotFound { device_id: id.clone() });
            }
            DeviceSelection::Default => state
                .devices
                .iter()
                .find(|d| d.kind == kind && d.is_default)
                .or_else(|| state.devices.iter().find(|d| d.kind == kind)),
        };
        found.cloned().ok_or_else(|| MediaError::NoSourceAvailable {
            kind: kind.to_string(),
        })
    }

    fn claim(&self, state: &mut MockState, device_id: &str, kind: TrackKind, label: &str) -> MediaTrack {
        state.in_use.insert(device_id.to_string());
        *state.opened.entry(device_id.to_string()).or_default() += 1;

        let shared = self.state.clone();
        let id = device_id.to_string();
        MediaTrack::new(kind, label, Some(device_id.to_string())).with_release(move || {
            let mut state = shared.lock();
            state.in_use.remove(&id);
            *state.released.entry(id).or_default() += 1;
        })
    }
}

impl Default for MockMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

fn device(id: &str, label: &str, kind: DeviceKind, is_default: bool) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        label: label.to_string(),
        kind,
        is_default,
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.state.lock().devices.clone())
    }

    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStreamHandle, MediaError> {
        let mut state = self.state.lock();
        if let Some(error) = state.user_media_failure.clone() {
            return Err(error);
        }

        let mut wanted = Vec::new();
        if let Some(selection) = &constraints.audio {
            wanted.push((TrackKind::Audio, Self::resolve(&state, DeviceKind::AudioInput, selection)?));
        }
        if let Some(selection) = &constraints.video {
            wanted.push((TrackKind::Video, Self::resolve(&state, DeviceKind::VideoInput, selection)?));
        }
        if wanted.is_empty() {
            return Err(MediaError::Unsupported("no audio or video requested".to_string()));
        }
        if let Some((_, busy)) = wanted.iter().find(|(_, d)| state.in_use.contains(&d.id)) {
            return Err(MediaError::DeviceInUse {
                device_id: busy.id.clone(),
            });
        }

        let tracks = wanted
            .iter()
            .map(|(kind, info)| self.claim(&mut state, &info.id, *kind, &info.label))
            .collect();
        Ok(MediaStreamHandle::new(StreamOrigin::Camera, tracks))
    }

    async fn open_display_media(&self, surface: DisplaySurface) -> Result<MediaStreamHandle, MediaError> {
        let mut state = self.state.lock();
        if let Some(error) = state.display_failure.clone() {
            return Err(error);
        }

        let device_id = format!("display:{}", surface);
        if state.in_use.contains(&device_id) {
            return Err(MediaError::DeviceInUse { device_id });
        }

        let track = self.claim(&mut state, &device_id, TrackKind::Video, &format!("{} capture", surface));
        state.display_tracks = vec![track.clone()];
        Ok(MediaStreamHandle::new(StreamOrigin::Display, vec![track]))
    }
}
