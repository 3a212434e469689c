//! Horizontal mirroring of the outgoing camera stream
//!
//! Front cameras are mirrored so the remote side sees the same image as the
//! local preview. The transform runs its own render loop that flips each new
//! source frame into a derived video track and recombines it with the source
//! audio tracks.

use crate::capture::MediaDeviceInfo;
use crate::error::{MediaError, MediaResult};
use crate::tracks::{FacingMode, MediaStream, MediaTrack, VideoFrame};
use image::imageops;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REAR_LABEL_HINTS: [&str; 3] = ["back", "rear", "environment"];

/// Mirror transform configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Output frame rate
    pub fps: u32,
    /// How long to wait for the first source frame before giving up
    pub ready_timeout_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            ready_timeout_ms: 1_000,
        }
    }
}

impl MirrorConfig {
    /// Validate configuration
    pub fn validate(&self) -> MediaResult<()> {
        if self.fps == 0 || self.fps > 120 {
            return Err(MediaError::InvalidConfiguration {
                message: "Invalid mirror framerate".to_string(),
            });
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(1_000 / u64::from(self.fps.max(1)))
    }
}

/// Whether a camera is positively identified as rear facing
pub fn is_rear_facing(device: &MediaDeviceInfo) -> bool {
    if device.facing_mode == Some(FacingMode::Environment) {
        return true;
    }
    let label = device.label.to_lowercase();
    REAR_LABEL_HINTS.iter().any(|hint| label.contains(hint))
}

/// Mirror decision: mirrored unless a rear camera is identified on a multi-camera device
pub fn should_mirror(device: Option<&MediaDeviceInfo>, has_multiple_cameras: bool) -> bool {
    match device {
        Some(device) if has_multiple_cameras => !is_rear_facing(device),
        _ => true,
    }
}

/// Flip a frame left to right
pub fn flip_horizontal(frame: &VideoFrame) -> MediaResult<VideoFrame> {
    let image = frame.to_image()?;
    Ok(VideoFrame::from_image(
        imageops::flip_horizontal(&image),
        frame.timestamp,
    ))
}

/// Running mirror transform
#[derive(Debug)]
pub struct MirrorTransform {
    output: MediaStream,
    derived: Option<MediaTrack>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MirrorTransform {
    /// Start mirroring `source`.
    ///
    /// When the source produces no frame within the ready timeout, the
    /// transform passes the source through unchanged instead.
    pub async fn start(
        source: &MediaStream,
        config: &MirrorConfig,
        parent: &CancellationToken,
    ) -> MediaResult<Self> {
        let cancel = parent.child_token();
        let Some(video) = source.video_track() else {
            debug!("No video track to mirror, passing stream through");
            return Ok(Self::passthrough(source, cancel));
        };

        let mut frames = video.subscribe_frames();
        let timeout = Duration::from_millis(config.ready_timeout_ms);
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(MediaError::Cancelled {
                    operation: "mirror transform".to_string(),
                });
            }
            ready = tokio::time::timeout(timeout, frames.wait_for(|f| f.is_some())) => {
                matches!(ready, Ok(Ok(_)))
            }
        };

        if !ready {
            warn!(
                "No frame from {} within {:?}, using unmirrored stream",
                video.label(),
                timeout
            );
            return Ok(Self::passthrough(source, cancel));
        }

        let derived = MediaTrack::video(format!("mirrored {}", video.label()), video.settings());
        derived.set_enabled(video.is_enabled());

        if let Some(frame) = frames.borrow_and_update().clone() {
            derived.push_frame(flip_horizontal(&frame)?);
        }

        let mut tracks = vec![derived.clone()];
        tracks.extend(source.audio_tracks());
        let output = MediaStream::new(tracks);

        let task = tokio::spawn(render_loop(
            video,
            frames,
            derived.clone(),
            config.frame_interval(),
            cancel.clone(),
        ));

        info!("Mirror transform started at {} fps", config.fps);
        Ok(Self {
            output,
            derived: Some(derived),
            cancel,
            task: Some(task),
        })
    }

    fn passthrough(source: &MediaStream, cancel: CancellationToken) -> Self {
        Self {
            output: source.clone(),
            derived: None,
            cancel,
            task: None,
        }
    }

    /// Mirrored stream (or the source when passing through)
    pub fn output(&self) -> &MediaStream {
        &self.output
    }

    /// Whether the source is passed through unmirrored
    pub fn is_passthrough(&self) -> bool {
        self.derived.is_none()
    }

    /// Stop the render loop and the derived track. Source tracks are left running.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(derived) = self.derived.take() {
            derived.stop();
        }
    }
}

impl Drop for MirrorTransform {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(derived) = &self.derived {
            derived.stop();
        }
    }
}

async fn render_loop(
    source: MediaTrack,
    mut frames: tokio::sync::watch::Receiver<Option<VideoFrame>>,
    output: MediaTrack,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !source.is_live() || !output.is_live() {
            debug!("Mirror source ended, stopping render loop");
            break;
        }

        if !frames.has_changed().unwrap_or(false) {
            continue;
        }
        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };

        match flip_horizontal(&frame) {
            Ok(flipped) => {
                output.push_frame(flipped);
            }
            Err(e) => warn!("Dropping unmirrorable frame: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticDevices;
    use crate::tracks::TrackSettings;

    #[test]
    fn test_mirror_decision() {
        let front = MediaDeviceInfo::camera("f", "FaceTime HD Camera", None);
        let back = MediaDeviceInfo::camera("b", "Back Camera", None);
        let env = MediaDeviceInfo::camera("e", "Camera 2", Some(FacingMode::Environment));

        assert!(should_mirror(None, false));
        assert!(should_mirror(Some(&front), true));
        assert!(!should_mirror(Some(&back), true));
        assert!(!should_mirror(Some(&env), true));
        // A lone camera is always mirrored, whatever its label says
        assert!(should_mirror(Some(&back), false));
    }

    #[test]
    fn test_flip_horizontal() {
        let frame = SyntheticDevices::test_pattern(4, 2, 0, 1);
        let flipped = flip_horizontal(&frame).unwrap();
        for y in 0..2 {
            for x in 0..4 {
                assert_eq!(flipped.pixel(x, y), frame.pixel(3 - x, y));
            }
        }
    }

    #[tokio::test]
    async fn test_transform_keeps_audio_and_flips_video() {
        let video = MediaTrack::video("cam", TrackSettings::default());
        let frame = SyntheticDevices::test_pattern(8, 4, 1, 1);
        video.push_frame(frame.clone());
        let audio = MediaTrack::audio("mic");
        let source = MediaStream::new(vec![video.clone(), audio.clone()]);

        let transform = MirrorTransform::start(&source, &MirrorConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!transform.is_passthrough());
        let output = transform.output().clone();
        assert!(output.audio_tracks()[0].same_track(&audio));
        let out_video = output.video_track().unwrap();
        assert!(!out_video.same_track(&video));
        assert_eq!(out_video.latest_frame().unwrap(), flip_horizontal(&frame).unwrap());

        transform.stop().await;
        assert!(!out_video.is_live());
        assert!(video.is_live());
        assert!(audio.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_falls_back_without_frames() {
        let video = MediaTrack::video("cam", TrackSettings::default());
        let source = MediaStream::new(vec![video.clone()]);

        let transform = MirrorTransform::start(&source, &MirrorConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(transform.is_passthrough());
        assert!(transform.output().same_tracks(&source));
    }

    #[tokio::test]
    async fn test_transform_aborts_when_cancelled() {
        let video = MediaTrack::video("cam", TrackSettings::default());
        let source = MediaStream::new(vec![video]);
        let parent = CancellationToken::new();
        parent.cancel();

        let result = MirrorTransform::start(&source, &MirrorConfig::default(), &parent).await;
        assert!(matches!(result, Err(MediaError::Cancelled { .. })));
    }
}
