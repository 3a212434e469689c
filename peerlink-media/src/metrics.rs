//! Orientation and aspect metrics used for display fitting

use crate::tracks::MediaStream;
use serde::{Deserialize, Serialize};

const DEFAULT_ASPECT_RATIO: f64 = 16.0 / 9.0;
const WIDE_LANDSCAPE_LIMIT: f64 = 2.1;
const TALL_PORTRAIT_LIMIT: f64 = 0.5;

/// Aspect and orientation of a video stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMetrics {
    /// Width divided by height
    pub aspect_ratio: f64,
    /// Whether the video is taller than wide
    pub is_portrait: bool,
}

impl Default for VideoMetrics {
    fn default() -> Self {
        Self {
            aspect_ratio: DEFAULT_ASPECT_RATIO,
            is_portrait: false,
        }
    }
}

impl VideoMetrics {
    /// Metrics from explicit dimensions
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if width == 0 || height == 0 {
            return Self::default();
        }
        Self {
            aspect_ratio: f64::from(width) / f64::from(height),
            is_portrait: height > width,
        }
    }

    /// Metrics of the first video track of a stream. Falls back to 16:9 landscape.
    pub fn from_stream(stream: &MediaStream) -> Self {
        stream
            .video_track()
            .map(|track| {
                let settings = track.settings();
                match (settings.width, settings.height) {
                    (Some(w), Some(h)) => Self::from_dimensions(w, h),
                    _ => Self::default(),
                }
            })
            .unwrap_or_default()
    }
}

/// How a video is fitted into its view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFit {
    /// Fill the view, cropping overflow
    Cover,
    /// Letterbox to show the whole frame
    Contain,
}

/// Inputs to the fit decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitContext {
    /// Metrics of the video being displayed
    pub video: VideoMetrics,
    /// Whether the local device is in portrait orientation
    pub device_portrait: bool,
    /// Whether this is the local preview
    pub is_local: bool,
    /// Whether the displayed stream is a screen share
    pub screen_sharing: bool,
    /// Whether background removal is active on the local stream
    pub background_removal: bool,
    /// Whether the local preview is mirrored
    pub mirrored: bool,
}

/// Choose cover or contain for a video view
pub fn object_fit(ctx: &FitContext) -> ObjectFit {
    if ctx.screen_sharing {
        return ObjectFit::Contain;
    }

    let orientation_matches = ctx.video.is_portrait == ctx.device_portrait;

    if ctx.is_local {
        if ctx.background_removal || ctx.mirrored || orientation_matches {
            return ObjectFit::Cover;
        }
        return ObjectFit::Contain;
    }

    if orientation_matches {
        return ObjectFit::Cover;
    }

    if !ctx.video.is_portrait && ctx.device_portrait {
        // landscape video on a portrait screen
        if ctx.video.aspect_ratio > WIDE_LANDSCAPE_LIMIT {
            return ObjectFit::Contain;
        }
        return ObjectFit::Cover;
    }

    if ctx.video.aspect_ratio < TALL_PORTRAIT_LIMIT {
        return ObjectFit::Contain;
    }
    ObjectFit::Cover
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::{MediaTrack, TrackSettings};

    fn remote(video: VideoMetrics, device_portrait: bool) -> FitContext {
        FitContext {
            video,
            device_portrait,
            is_local: false,
            screen_sharing: false,
            background_removal: false,
            mirrored: false,
        }
    }

    #[test]
    fn test_metrics_from_stream() {
        let track = MediaTrack::video(
            "cam",
            TrackSettings {
                width: Some(720),
                height: Some(1280),
                ..Default::default()
            },
        );
        let metrics = VideoMetrics::from_stream(&MediaStream::new(vec![track]));
        assert!(metrics.is_portrait);
        assert!((metrics.aspect_ratio - 0.5625).abs() < 1e-9);

        let empty = VideoMetrics::from_stream(&MediaStream::new(vec![]));
        assert_eq!(empty, VideoMetrics::default());
    }

    #[test]
    fn test_screen_share_contains() {
        let mut ctx = remote(VideoMetrics::from_dimensions(1920, 1080), false);
        ctx.screen_sharing = true;
        assert_eq!(object_fit(&ctx), ObjectFit::Contain);
    }

    #[test]
    fn test_local_preview_fit() {
        let mut ctx = remote(VideoMetrics::from_dimensions(1280, 720), true);
        ctx.is_local = true;
        assert_eq!(object_fit(&ctx), ObjectFit::Contain);
        ctx.mirrored = true;
        assert_eq!(object_fit(&ctx), ObjectFit::Cover);
    }

    #[test]
    fn test_remote_fit_limits() {
        let normal = remote(VideoMetrics::from_dimensions(1280, 720), true);
        assert_eq!(object_fit(&normal), ObjectFit::Cover);

        let ultrawide = remote(VideoMetrics::from_dimensions(2560, 1080), true);
        assert_eq!(object_fit(&ultrawide), ObjectFit::Contain);

        let tall = remote(VideoMetrics::from_dimensions(400, 1000), false);
        assert_eq!(object_fit(&tall), ObjectFit::Contain);

        let matching = remote(VideoMetrics::from_dimensions(720, 1280), true);
        assert_eq!(object_fit(&matching), ObjectFit::Cover);
    }
}
