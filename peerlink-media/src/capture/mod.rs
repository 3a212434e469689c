//! Capture source: camera and microphone acquisition
//!
//! [`MediaDevices`] is the seam to the platform's device layer. The
//! [`CaptureSource`] sits on top of it and exclusively owns the hardware
//! tracks it acquires until they are explicitly stopped.

pub mod synthetic;

pub use synthetic::SyntheticDevices;

use crate::error::{MediaError, MediaResult};
use crate::tracks::{FacingMode, MediaStream};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kind of input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Camera
    VideoInput,
    /// Microphone
    AudioInput,
}

/// Device information returned by enumeration
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDeviceInfo {
    /// Stable device identifier
    pub device_id: String,
    /// Human readable label
    pub label: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Facing mode, when the platform reports it
    pub facing_mode: Option<FacingMode>,
}

impl MediaDeviceInfo {
    /// Describe a camera
    pub fn camera(device_id: &str, label: &str, facing_mode: Option<FacingMode>) -> Self {
        Self {
            device_id: device_id.to_string(),
            label: label.to_string(),
            kind: DeviceKind::VideoInput,
            facing_mode,
        }
    }

    /// Describe a microphone
    pub fn microphone(device_id: &str, label: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            label: label.to_string(),
            kind: DeviceKind::AudioInput,
            facing_mode: None,
        }
    }
}

/// Video part of a capture request
#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    /// Exact device to open, or any camera when `None`
    pub device_id: Option<String>,
    /// Preferred width
    pub ideal_width: u32,
    /// Preferred height
    pub ideal_height: u32,
}

/// Camera/microphone capture request
#[derive(Debug, Clone, PartialEq)]
pub struct MediaConstraints {
    /// Video request, `None` for audio only
    pub video: Option<VideoConstraints>,
    /// Whether to capture the microphone
    pub audio: bool,
}

/// Display capture request. Video is always captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayConstraints {
    /// Whether to capture system audio
    pub audio: bool,
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Preferred capture width
    pub ideal_width: u32,
    /// Preferred capture height
    pub ideal_height: u32,
    /// Capture the microphone alongside the camera
    pub audio: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            audio: true,
        }
    }
}

impl CaptureConfig {
    /// Validate configuration
    pub fn validate(&self) -> MediaResult<()> {
        if self.ideal_width == 0 || self.ideal_height == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: "Invalid capture resolution".to_string(),
            });
        }
        Ok(())
    }
}

/// Platform device layer
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and/or microphone
    async fn get_user_media(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream>;

    /// Open a display capture
    async fn get_display_media(&self, constraints: &DisplayConstraints) -> MediaResult<MediaStream>;

    /// List available input devices
    async fn enumerate_devices(&self) -> MediaResult<Vec<MediaDeviceInfo>>;
}

/// Owner of the local camera and microphone tracks
pub struct CaptureSource {
    devices: Arc<dyn MediaDevices>,
    config: CaptureConfig,
    cameras: Vec<MediaDeviceInfo>,
    device_id: Option<String>,
    stream: Option<MediaStream>,
}

impl CaptureSource {
    /// Create a capture source on top of a device layer
    pub fn new(devices: Arc<dyn MediaDevices>, config: CaptureConfig) -> Self {
        Self {
            devices,
            config,
            cameras: Vec::new(),
            device_id: None,
            stream: None,
        }
    }

    /// Device layer used for display capture as well
    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        self.devices.clone()
    }

    /// Re-enumerate cameras
    pub async fn refresh_devices(&mut self) -> MediaResult<&[MediaDeviceInfo]> {
        let all = self.devices.enumerate_devices().await?;
        self.cameras = all
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect();
        debug!("Found {} camera(s)", self.cameras.len());
        Ok(&self.cameras)
    }

    /// Cameras seen at the last enumeration
    pub fn cameras(&self) -> &[MediaDeviceInfo] {
        &self.cameras
    }

    /// Whether more than one camera is available
    pub fn has_multiple_cameras(&self) -> bool {
        self.cameras.len() > 1
    }

    /// Camera currently in use
    pub fn current_device(&self) -> Option<&MediaDeviceInfo> {
        let id = self.device_id.as_deref()?;
        self.cameras.iter().find(|d| d.device_id == id)
    }

    /// Live capture stream, if acquired
    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    fn video_constraints(&self, device_id: Option<String>) -> VideoConstraints {
        VideoConstraints {
            device_id,
            ideal_width: self.config.ideal_width,
            ideal_height: self.config.ideal_height,
        }
    }

    /// Acquire camera and microphone, reusing the live stream if there is one
    pub async fn acquire(&mut self) -> MediaResult<MediaStream> {
        if let Some(stream) = self.stream.as_ref().filter(|s| s.is_active()) {
            return Ok(stream.clone());
        }

        self.refresh_devices().await?;
        let device_id = self
            .device_id
            .clone()
            .or_else(|| self.cameras.first().map(|d| d.device_id.clone()));

        let stream = self
            .devices
            .get_user_media(&MediaConstraints {
                video: Some(self.video_constraints(device_id.clone())),
                audio: self.config.audio,
            })
            .await?;

        self.device_id = stream
            .video_track()
            .and_then(|t| t.settings().device_id)
            .or(device_id);

        info!(
            "Acquired capture stream {} ({} video, {} audio)",
            stream.id(),
            stream.video_tracks().len(),
            stream.audio_tracks().len()
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Open a fresh video track on the current camera, keeping the audio tracks
    pub async fn reacquire_video(&mut self) -> MediaResult<MediaStream> {
        let Some(current) = self.stream.clone() else {
            return self.acquire().await;
        };
        let device_id = self.device_id.clone();
        self.replace_video(current, device_id).await
    }

    /// Cycle to the next camera. With a single camera the live stream is kept.
    pub async fn switch_camera(&mut self) -> MediaResult<MediaStream> {
        self.refresh_devices().await?;
        let current = self.acquire().await?;

        if !self.has_multiple_cameras() {
            debug!("Only one camera available, not switching");
            return Ok(current);
        }

        let index = self
            .device_id
            .as_deref()
            .and_then(|id| self.cameras.iter().position(|d| d.device_id == id))
            .map(|i| (i + 1) % self.cameras.len())
            .unwrap_or(0);
        let next = self.cameras[index].device_id.clone();

        info!("Switching camera to {}", self.cameras[index].label);
        self.replace_video(current, Some(next)).await
    }

    async fn replace_video(
        &mut self,
        current: MediaStream,
        device_id: Option<String>,
    ) -> MediaResult<MediaStream> {
        let fresh = self
            .devices
            .get_user_media(&MediaConstraints {
                video: Some(self.video_constraints(device_id.clone())),
                audio: false,
            })
            .await?;

        let Some(video) = fresh.video_track() else {
            warn!("Device layer returned no video track");
            return Err(MediaError::CaptureNotActive);
        };

        current.stop_video();

        let mut tracks = vec![video];
        tracks.extend(current.audio_tracks());
        let stream = MediaStream::new(tracks);

        self.device_id = device_id;
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Mute or unmute the microphone
    pub fn set_muted(&self, muted: bool) {
        if let Some(stream) = &self.stream {
            for track in stream.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
    }

    /// Enable or disable the camera track
    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(stream) = &self.stream {
            for track in stream.video_tracks() {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stop all hardware tracks and forget the stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("Stopping capture stream {}", stream.id());
            stream.stop_all();
        }
    }
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("config", &self.config)
            .field("cameras", &self.cameras.len())
            .field("device_id", &self.device_id)
            .field("stream", &self.stream.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}
