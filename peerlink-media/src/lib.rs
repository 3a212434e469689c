//! # PeerLink Media
//!
//! Local media for PeerLink: capture devices, the track and stream model,
//! horizontal mirroring, segmentation-driven background compositing and the
//! stream pipeline that derives the publishable stream from all of them.

#![warn(clippy::all)]

pub mod capture;
pub mod compositor;
pub mod error;
pub mod metrics;
pub mod mirror;
pub mod pipeline;
pub mod segmentation;
pub mod tracks;

// Re-export main types
pub use capture::{
    CaptureConfig, CaptureSource, DeviceKind, DisplayConstraints, MediaConstraints,
    MediaDeviceInfo, MediaDevices, SyntheticDevices, VideoConstraints,
};
pub use compositor::{
    composite, BackgroundCompositor, BackgroundLibrary, CompositorConfig, CompositorContext,
    ResourceCounters, ResourceStats, BUNDLED_BACKGROUNDS, DEFAULT_BACKGROUND,
};
pub use error::{ErrorCategory, MediaError, MediaResult};
pub use metrics::{object_fit, FitContext, ObjectFit, VideoMetrics};
pub use mirror::{flip_horizontal, is_rear_facing, should_mirror, MirrorConfig, MirrorTransform};
pub use pipeline::{
    PipelineConfig, PipelineSettings, PreviewView, StreamPipeline, ToggleOutcome,
};
pub use segmentation::{
    Architecture, FixedRegionModel, Mask, ModelSlot, ModelSlotConfig, Resolution,
    SegmentOptions, SegmentationConfig, SegmentationLoader, SegmentationModel, StaticLoader,
};
pub use tracks::{FacingMode, MediaStream, MediaTrack, TrackKind, TrackSettings, VideoFrame};
