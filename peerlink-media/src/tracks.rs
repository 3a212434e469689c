//! Track, stream and frame abstractions
//!
//! A [`MediaTrack`] is a cheap-to-clone handle: every clone refers to the same
//! underlying track, so muting or stopping through one handle is visible
//! through all of them. This is what lets a processed stream share the audio
//! tracks of the raw capture.

use crate::error::{MediaError, MediaResult};
use bytes::Bytes;
use image::RgbaImage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio samples
    Audio,
    /// Video frames
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Direction a camera is facing, when the device reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera, facing the user
    User,
    /// Rear camera, facing away from the user
    Environment,
}

/// Settings reported by a live track
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackSettings {
    /// Frame width in pixels
    pub width: Option<u32>,
    /// Frame height in pixels
    pub height: Option<u32>,
    /// Source device identifier
    pub device_id: Option<String>,
    /// Facing mode, if the device reports it
    pub facing_mode: Option<FacingMode>,
}

/// Video frame representation (RGBA8, row major)
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel data, four bytes per pixel
    pub data: Bytes,
    /// Timestamp in milliseconds
    pub timestamp: u64,
}

impl VideoFrame {
    /// Create a frame, validating the buffer size
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>, timestamp: u64) -> MediaResult<Self> {
        let data = data.into();
        let expected = Self::expected_len(width, height);
        if data.len() != expected {
            return Err(MediaError::InvalidFrameData {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
            timestamp,
        })
    }

    /// Frame filled with a single colour
    pub fn solid(width: u32, height: u32, rgba: [u8; 4], timestamp: u64) -> Self {
        let data: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(Self::expected_len(width, height))
            .collect();
        Self {
            width,
            height,
            data: Bytes::from(data),
            timestamp,
        }
    }

    /// Number of bytes a frame of the given size occupies
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Read one pixel
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.data.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Borrow the frame as an image buffer
    pub fn to_image(&self) -> MediaResult<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data.to_vec()).ok_or(
            MediaError::InvalidFrameData {
                expected: Self::expected_len(self.width, self.height),
                actual: self.data.len(),
            },
        )
    }

    /// Wrap an image buffer as a frame
    pub fn from_image(image: RgbaImage, timestamp: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: Bytes::from(image.into_raw()),
            timestamp,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    settings: RwLock<TrackSettings>,
    ended: watch::Sender<bool>,
    frames: watch::Sender<Option<VideoFrame>>,
}

/// Shared handle to a single audio or video track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    fn new(kind: TrackKind, label: impl Into<String>, settings: TrackSettings) -> Self {
        let (ended, _) = watch::channel(false);
        let (frames, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                settings: RwLock::new(settings),
                ended,
                frames,
            }),
        }
    }

    /// Create a video track
    pub fn video(label: impl Into<String>, settings: TrackSettings) -> Self {
        Self::new(TrackKind::Video, label, settings)
    }

    /// Create an audio track
    pub fn audio(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Audio, label, TrackSettings::default())
    }

    /// Get track ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get track kind
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Human readable label (usually the device name)
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the track is enabled (not muted)
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or mute the track
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current settings snapshot
    pub fn settings(&self) -> TrackSettings {
        self.inner.settings.read().clone()
    }

    /// Replace the settings
    pub fn update_settings(&self, settings: TrackSettings) {
        *self.inner.settings.write() = settings;
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        let was_live = !self.inner.ended.send_replace(true);
        if was_live {
            debug!("Stopped {} track {} ({})", self.inner.kind, self.inner.id, self.inner.label);
        }
    }

    /// Whether the track has not been stopped
    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    /// Wait until the track is stopped
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Publish a new frame on a video track. Ignored once the track has ended.
    pub fn push_frame(&self, frame: VideoFrame) -> bool {
        if !self.is_live() {
            return false;
        }
        self.inner.frames.send_replace(Some(frame));
        true
    }

    /// Most recent frame, if any
    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.inner.frames.borrow().clone()
    }

    /// Subscribe to frame updates
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<VideoFrame>> {
        self.inner.frames.subscribe()
    }

    /// Whether two handles refer to the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Ordered collection of tracks published or received together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create a stream from tracks
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks in insertion order
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Video tracks
    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video).cloned()
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio).cloned()
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == kind).cloned().collect()
    }

    /// Append a track
    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    /// Whether the stream carries audio
    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    /// Whether any track is still live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Stop only the video tracks
    pub fn stop_video(&self) {
        for track in self.tracks.iter().filter(|t| t.kind() == TrackKind::Video) {
            track.stop();
        }
    }

    /// Whether both streams hold the same tracks in the same order
    pub fn same_tracks(&self, other: &MediaStream) -> bool {
        self.tracks.len() == other.tracks.len()
            && self
                .tracks
                .iter()
                .zip(other.tracks.iter())
                .all(|(a, b)| a.same_track(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_validation() {
        assert!(VideoFrame::new(2, 2, vec![0u8; 16], 0).is_ok());
        assert_eq!(
            VideoFrame::new(2, 2, vec![0u8; 15], 0),
            Err(MediaError::InvalidFrameData {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn test_solid_frame_pixels() {
        let frame = VideoFrame::solid(3, 2, [1, 2, 3, 255], 7);
        assert_eq!(frame.pixel(2, 1), Some([1, 2, 3, 255]));
        assert_eq!(frame.pixel(3, 0), None);
    }

    #[test]
    fn test_cloned_handles_share_state() {
        let track = MediaTrack::audio("mic");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        track.stop();
        assert!(!clone.is_live());
        assert!(track.same_track(&clone));
    }

    #[test]
    fn test_push_frame_after_stop_is_ignored() {
        let track = MediaTrack::video("cam", TrackSettings::default());
        assert!(track.push_frame(VideoFrame::solid(1, 1, [0, 0, 0, 255], 1)));
        track.stop();
        assert!(!track.push_frame(VideoFrame::solid(1, 1, [9, 9, 9, 255], 2)));
        assert_eq!(track.latest_frame().map(|f| f.timestamp), Some(1));
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = MediaTrack::video("screen", TrackSettings::default());
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        waiter.await.unwrap();
    }

    #[test]
    fn test_stream_partitions_tracks() {
        let stream = MediaStream::new(vec![
            MediaTrack::video("cam", TrackSettings::default()),
            MediaTrack::audio("mic"),
        ]);
        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(stream.audio_tracks().len(), 1);
        assert!(stream.is_active());
        stream.stop_all();
        assert!(!stream.is_active());
    }
}
