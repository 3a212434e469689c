//! In-process device layer producing deterministic test patterns
//!
//! Useful for demos, headless environments and tests. Every issued track is
//! remembered so callers can check that nothing was left running.

use super::{DisplayConstraints, MediaConstraints, MediaDeviceInfo, MediaDevices};
use crate::error::{MediaError, MediaResult};
use crate::tracks::{FacingMode, MediaStream, MediaTrack, TrackSettings, VideoFrame};
use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_core::unix_millis;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Synthetic cameras, microphone and display
pub struct SyntheticDevices {
    cameras: Vec<MediaDeviceInfo>,
    microphone: bool,
    width: u32,
    height: u32,
    emit_frames: bool,
    deny_camera: AtomicBool,
    deny_display: AtomicBool,
    issued: Mutex<Vec<MediaTrack>>,
}

impl SyntheticDevices {
    /// A single front-facing camera and a microphone
    pub fn new() -> Self {
        Self::with_cameras(vec![MediaDeviceInfo::camera(
            "synthetic-front",
            "Synthetic Front Camera",
            Some(FacingMode::User),
        )])
    }

    /// Front and back camera, as on a phone
    pub fn front_and_back() -> Self {
        Self::with_cameras(vec![
            MediaDeviceInfo::camera("synthetic-front", "Front Camera", Some(FacingMode::User)),
            MediaDeviceInfo::camera("synthetic-back", "Back Camera", None),
        ])
    }

    /// Custom camera list
    pub fn with_cameras(cameras: Vec<MediaDeviceInfo>) -> Self {
        Self {
            cameras,
            microphone: true,
            width: 64,
            height: 48,
            emit_frames: true,
            deny_camera: AtomicBool::new(false),
            deny_display: AtomicBool::new(false),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Size of the frames produced by every video track
    pub fn frame_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Issue video tracks that never produce a frame
    pub fn without_frames(mut self) -> Self {
        self.emit_frames = false;
        self
    }

    /// Remove the microphone
    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    /// Deny (or allow again) camera and microphone access
    pub fn set_camera_denied(&self, denied: bool) {
        self.deny_camera.store(denied, Ordering::SeqCst);
    }

    /// Deny (or allow again) display capture
    pub fn set_display_denied(&self, denied: bool) {
        self.deny_display.store(denied, Ordering::SeqCst);
    }

    /// Every track handed out so far
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    /// Handed-out tracks that are still running
    pub fn live_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().iter().filter(|t| t.is_live()).cloned().collect()
    }

    /// Horizontal/vertical gradient. Left and right halves differ, so a flip is detectable.
    pub fn test_pattern(width: u32, height: u32, seed: u8, timestamp: u64) -> VideoFrame {
        let wx = width.saturating_sub(1).max(1);
        let hy = height.saturating_sub(1).max(1);
        let mut data = Vec::with_capacity(VideoFrame::expected_len(width, height));
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[
                    (x * 255 / wx) as u8,
                    (y * 255 / hy) as u8,
                    seed,
                    255,
                ]);
            }
        }
        VideoFrame {
            width,
            height,
            data: data.into(),
            timestamp,
        }
    }

    fn video_track(&self, label: &str, device: Option<&MediaDeviceInfo>, seed: u8) -> MediaTrack {
        let track = MediaTrack::video(
            label,
            TrackSettings {
                width: Some(self.width),
                height: Some(self.height),
                device_id: device.map(|d| d.device_id.clone()),
                facing_mode: device.and_then(|d| d.facing_mode),
            },
        );
        if self.emit_frames {
            track.push_frame(Self::test_pattern(self.width, self.height, seed, unix_millis()));
        }
        self.issued.lock().push(track.clone());
        track
    }

    fn audio_track(&self, label: &str) -> MediaTrack {
        let track = MediaTrack::audio(label);
        self.issued.lock().push(track.clone());
        track
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream> {
        if constraints.video.is_none() && !constraints.audio {
            return Err(MediaError::InvalidConfiguration {
                message: "At least one of audio and video must be requested".to_string(),
            });
        }
        if self.deny_camera.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied {
                operation: "camera and microphone access".to_string(),
            });
        }

        let mut tracks = Vec::new();
        if let Some(video) = &constraints.video {
            let device = match &video.device_id {
                Some(id) => Some(
                    self.cameras
                        .iter()
                        .find(|d| &d.device_id == id)
                        .ok_or_else(|| MediaError::DeviceNotFound {
                            device_id: id.clone(),
                        })?,
                ),
                None => self.cameras.first(),
            };
            let Some(device) = device else {
                return Err(MediaError::DeviceNotFound {
                    device_id: "default camera".to_string(),
                });
            };
            tracks.push(self.video_track(&device.label, Some(device), 0x40));
        }
        if constraints.audio && self.microphone {
            tracks.push(self.audio_track("Synthetic Microphone"));
        }

        debug!("Synthetic get_user_media issued {} track(s)", tracks.len());
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self, _constraints: &DisplayConstraints) -> MediaResult<MediaStream> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied {
                operation: "display capture".to_string(),
            });
        }
        let track = self.video_track("Synthetic Screen", None, 0xC0);
        Ok(MediaStream::new(vec![track]))
    }

    async fn enumerate_devices(&self) -> MediaResult<Vec<MediaDeviceInfo>> {
        let mut devices = self.cameras.clone();
        if self.microphone {
            devices.push(MediaDeviceInfo::microphone(
                "synthetic-mic",
                "Synthetic Microphone",
            ));
        }
        Ok(devices)
    }
}
