//! Microphone capture through cpal
//!
//! cpal only exposes audio hardware, so camera and display requests report no
//! source. Each capture runs on its own thread because cpal streams are not
//! `Send`; stopping the track signals that thread, which drops the stream.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::media::{
    DeviceInfo, DeviceKind, DeviceSelection, DisplaySurface, MediaConstraints, MediaError,
    MediaSource, MediaStreamHandle, MediaTrack, StreamOrigin, TrackKind,
};

/// Media source backed by the default cpal host
#[derive(Debug, Default)]
pub struct CpalMediaSource;

impl CpalMediaSource {
    pub fn new() -> Self {
        Self
    }

    fn find_input(selection: &DeviceSelection) -> Result<cpal::Device, MediaError> {
        let host = cpal::default_host();
        match selection {
            DeviceSelection::Default => host.default_input_device().ok_or_else(|| MediaError::NoSourceAvailable {
                kind: DeviceKind::AudioInput.to_string(),
            }),
            DeviceSelection::Exact(id) => {
                let devices = host
                    .input_devices()
                    .map_err(|e| MediaError::Platform(format!("Failed to enumerate input devices: {}", e)))?;
                for device in devices {
                    if device.name().ok().as_deref() == Some(id.as_str()) {
                        return Ok(device);
                    }
                }
                Err(MediaError::DeviceNotFound { device_id: id.clone() })
            }
        }
    }

    fn build_stream(device: &cpal::Device) -> Result<cpal::Stream, String> {
        let supported = device
            .default_input_config()
            .map_err(|e| format!("no usable input config: {}", e))?;
        let config = supported.config();
        let on_error = |err: cpal::StreamError| error!("Microphone capture error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(&config, |_: &[f32], _: &cpal::InputCallbackInfo| {}, on_error, None),
            cpal::SampleFormat::I16 => device.build_input_stream(&config, |_: &[i16], _: &cpal::InputCallbackInfo| {}, on_error, None),
            cpal::SampleFormat::U16 => device.build_input_stream(&config, |_: &[u16], _: &cpal::InputCallbackInfo| {}, on_error, None),
            other => return Err(format!("unsupported sample format {:?}", other)),
        };
        stream.map_err(|e| format!("failed to build input stream: {}", e))
    }
}

#[async_trait]
impl MediaSource for CpalMediaSource {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| MediaError::Platform(format!("Failed to enumerate input devices: {}", e)))?;

        let mut infos = Vec::new();
        for device in devices {
            let name = match device.name() {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping input device without a name: {}", e);
                    continue;
                }
            };
            infos.push(DeviceInfo {
                id: name.clone(),
                label: name.clone(),
                kind: DeviceKind::AudioInput,
                is_default: default_name.as_deref() == Some(name.as_str()),
            });
        }
        Ok(infos)
    }

    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStreamHandle, MediaError> {
        if constraints.video.is_some() {
            return Err(MediaError::NoSourceAvailable {
                kind: DeviceKind::VideoInput.to_string(),
            });
        }
        let selection = constraints
            .audio
            .as_ref()
            .ok_or_else(|| MediaError::Unsupported("no audio requested".to_string()))?;

        let device = Self::find_input(selection)?;
        let device_name = device.name().unwrap_or_else(|_| "microphone".to_string());

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread_name = device_name.clone();
        std::thread::spawn(move || {
            let stream = match Self::build_stream(&device) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(format!("failed to start input stream: {}", e)));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            info!("Started microphone capture on {}", thread_name);

            // Stream is dropped when the track is stopped
            let _ = shutdown_rx.blocking_recv();
            drop(stream);
            info!("Stopped microphone capture on {}", thread_name);
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(MediaError::Platform(message)),
            Err(_) => return Err(MediaError::Platform("capture thread exited".to_string())),
        }

        let track = MediaTrack::new(TrackKind::Audio, device_name.clone(), Some(device_name)).with_release(move || {
            let _ = shutdown_tx.send(());
        });
        Ok(MediaStreamHandle::new(StreamOrigin::Camera, vec![track]))
    }

    async fn open_display_media(&self, _surface: DisplaySurface) -> Result<MediaStreamHandle, MediaError> {
        Err(MediaError::NoSourceAvailable {
            kind: "display".to_string(),
        })
    }
}
