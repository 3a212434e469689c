//! Stream pipeline: raw capture to publishable stream
//!
//! The pipeline owns every derived track and compositing surface. Its output
//! is always derived from the raw capture and the current settings, never
//! edited directly, and always carries the raw capture's audio tracks.

use crate::capture::CaptureSource;
use crate::compositor::{
    BackgroundCompositor, BackgroundLibrary, CompositorConfig, CompositorContext, ResourceCounters,
    ResourceStats, DEFAULT_BACKGROUND,
};
use crate::error::{MediaError, MediaResult};
use crate::mirror::{MirrorConfig, MirrorTransform};
use crate::segmentation::{ModelSlot, SegmentOptions};
use crate::tracks::MediaStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Mirror transform settings
    pub mirror: MirrorConfig,
    /// Compositor surface and loop settings
    pub compositor: CompositorConfig,
    /// Per-frame segmentation options
    pub segment: SegmentOptions,
}

impl PipelineConfig {
    /// Validate configuration
    pub fn validate(&self) -> MediaResult<()> {
        self.mirror.validate()?;
        self.compositor.validate()
    }
}

/// Inputs the output stream is derived from
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Mirror the outgoing video
    pub mirror_enabled: bool,
    /// Replace the background
    pub background_removal_enabled: bool,
    /// Background reference used by the compositor
    pub selected_background: Option<String>,
    /// Microphone muted
    pub muted: bool,
    /// Camera enabled
    pub video_enabled: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mirror_enabled: true,
            background_removal_enabled: false,
            selected_background: Some(DEFAULT_BACKGROUND.to_string()),
            muted: false,
            video_enabled: true,
        }
    }
}

/// What the local preview should show
#[derive(Debug, Clone)]
pub struct PreviewView {
    /// Stream to render
    pub stream: MediaStream,
    /// Whether the view should flip the stream on display
    pub display_mirror: bool,
}

/// Result of a pipeline change that may fall back
#[derive(Debug, Clone)]
pub struct ToggleOutcome {
    /// Stream to publish. `None` only when the toggle was cancelled by teardown.
    pub output: Option<MediaStream>,
    /// Background removal state after the toggle
    pub enabled: bool,
    /// Failure that caused a revert
    pub error: Option<MediaError>,
}

impl ToggleOutcome {
    /// Whether the requested state was reverted
    pub fn reverted(&self) -> bool {
        self.error.is_some()
    }
}

/// Owner of the derived stream and its transforms
pub struct StreamPipeline {
    config: PipelineConfig,
    models: Arc<ModelSlot>,
    library: Arc<BackgroundLibrary>,
    counters: Arc<ResourceCounters>,
    settings: PipelineSettings,
    raw: Option<MediaStream>,
    mirror: Option<MirrorTransform>,
    compositor: Option<BackgroundCompositor>,
    output: Option<MediaStream>,
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("settings", &self.settings)
            .field("mirror", &self.mirror.is_some())
            .field("compositor", &self.compositor.is_some())
            .field("output", &self.output.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

impl StreamPipeline {
    /// Create an idle pipeline
    pub fn new(config: PipelineConfig, models: Arc<ModelSlot>, library: Arc<BackgroundLibrary>) -> Self {
        Self {
            config,
            models,
            library,
            counters: Arc::new(ResourceCounters::default()),
            settings: PipelineSettings::default(),
            raw: None,
            mirror: None,
            compositor: None,
            output: None,
        }
    }

    /// Current settings
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Raw capture the output was derived from
    pub fn raw(&self) -> Option<&MediaStream> {
        self.raw.as_ref()
    }

    /// Publishable output, which is also the last known good stream
    pub fn output(&self) -> Option<&MediaStream> {
        self.output.as_ref()
    }

    /// Compositing resource accounting
    pub fn resource_stats(&self) -> ResourceStats {
        self.counters.snapshot()
    }

    /// Background images
    pub fn library(&self) -> &Arc<BackgroundLibrary> {
        &self.library
    }

    /// Shared model slot
    pub fn models(&self) -> &Arc<ModelSlot> {
        &self.models
    }

    /// Derive the output from `raw`, replacing any previous derivation
    pub async fn derive(
        &mut self,
        raw: MediaStream,
        mirror_enabled: bool,
        cancel: &CancellationToken,
    ) -> MediaResult<MediaStream> {
        self.release_derived().await;
        self.raw = Some(raw.clone());
        self.settings.mirror_enabled = mirror_enabled;

        match self.build(&raw, cancel).await {
            Ok(output) => {
                self.output = Some(output.clone());
                self.apply_track_state();
                info!(
                    "Derived stream {} (mirror: {}, background removal: {})",
                    output.id(),
                    self.settings.mirror_enabled,
                    self.settings.background_removal_enabled
                );
                Ok(output)
            }
            Err(e) => {
                self.release_derived().await;
                self.output = None;
                Err(e)
            }
        }
    }

    async fn build(&mut self, raw: &MediaStream, cancel: &CancellationToken) -> MediaResult<MediaStream> {
        let source = if self.settings.mirror_enabled {
            let transform = MirrorTransform::start(raw, &self.config.mirror, cancel).await?;
            let output = transform.output().clone();
            self.mirror = Some(transform);
            output
        } else {
            raw.clone()
        };

        if !self.settings.background_removal_enabled {
            return Ok(source);
        }

        let models = self.models.clone();
        let model = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(MediaError::Cancelled {
                    operation: "segmentation model load".to_string(),
                });
            }
            model = models.get() => model?,
        };

        let compositor = BackgroundCompositor::start(
            &source,
            CompositorContext {
                model,
                library: self.library.clone(),
                counters: self.counters.clone(),
                config: self.config.compositor.clone(),
                options: self.config.segment.clone(),
            },
            self.settings.selected_background.clone(),
            cancel,
        )?;
        let output = compositor.output().clone();
        self.compositor = Some(compositor);
        Ok(output)
    }

    /// Turn background removal on or off.
    ///
    /// The flag flips before the work starts and is reverted if the work
    /// fails, in which case the output is re-derived with the previous
    /// settings so there is always something to publish.
    pub async fn set_background_removal(
        &mut self,
        enabled: bool,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> ToggleOutcome {
        let previous = self.settings.background_removal_enabled;
        if previous == enabled && self.output.is_some() {
            return ToggleOutcome {
                output: self.output.clone(),
                enabled,
                error: None,
            };
        }

        self.settings.background_removal_enabled = enabled;
        let result = if enabled {
            self.enable_background(capture, cancel).await
        } else {
            self.disable_background(capture, cancel).await
        };

        match result {
            Ok(output) => ToggleOutcome {
                output: Some(output),
                enabled,
                error: None,
            },
            Err(e @ MediaError::Cancelled { .. }) => {
                debug!("Background toggle cancelled by teardown");
                self.settings.background_removal_enabled = previous;
                ToggleOutcome {
                    output: None,
                    enabled: previous,
                    error: Some(e),
                }
            }
            Err(e) => {
                warn!("Background toggle failed, reverting: {}", e);
                self.settings.background_removal_enabled = previous;
                let output = self.recover(capture, cancel).await;
                ToggleOutcome {
                    output,
                    enabled: self.settings.background_removal_enabled,
                    error: Some(e),
                }
            }
        }
    }

    /// Derive from a new raw capture, such as after a camera switch.
    ///
    /// On failure the output is recovered the same way a failed toggle is.
    pub async fn switch_source(
        &mut self,
        raw: MediaStream,
        mirror_enabled: bool,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> ToggleOutcome {
        match self.derive(raw, mirror_enabled, cancel).await {
            Ok(output) => ToggleOutcome {
                output: Some(output),
                enabled: self.settings.background_removal_enabled,
                error: None,
            },
            Err(e @ MediaError::Cancelled { .. }) => ToggleOutcome {
                output: None,
                enabled: self.settings.background_removal_enabled,
                error: Some(e),
            },
            Err(e) => {
                warn!("Source switch failed, recovering: {}", e);
                let output = self.recover(capture, cancel).await;
                ToggleOutcome {
                    output,
                    enabled: self.settings.background_removal_enabled,
                    error: Some(e),
                }
            }
        }
    }

    /// Fault channel of the running compositor, keyed by the stream it feeds
    pub fn compositor_faults(&self) -> Option<(String, watch::Receiver<Option<MediaError>>)> {
        let compositor = self.compositor.as_ref()?;
        Some((compositor.output().id().to_string(), compositor.faults()))
    }

    /// Turn background removal off after the compositor feeding `stream_id`
    /// stopped on `error`, and re-derive the plain stream.
    ///
    /// Returns `None` when that compositor is no longer the active output.
    pub async fn handle_compositor_fault(
        &mut self,
        stream_id: &str,
        error: MediaError,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> Option<ToggleOutcome> {
        let current = self.compositor.as_ref().map(|c| c.output().id().to_string());
        if !self.settings.background_removal_enabled || current.as_deref() != Some(stream_id) {
            debug!("Ignoring fault from stale compositor {}", stream_id);
            return None;
        }

        warn!("Compositor failed, turning background removal off: {}", error);
        self.settings.background_removal_enabled = false;
        let output = self.recover(capture, cancel).await;
        Some(ToggleOutcome {
            output,
            enabled: false,
            error: Some(error),
        })
    }

    /// Outcome of a toggle that failed before the pipeline was touched.
    /// The settings stay as they are and the current output is kept.
    pub async fn keep_current(
        &mut self,
        error: MediaError,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> ToggleOutcome {
        let output = match self.output.clone().filter(MediaStream::is_active) {
            Some(output) => Some(output),
            None => self.recover(capture, cancel).await,
        };
        ToggleOutcome {
            output,
            enabled: self.settings.background_removal_enabled,
            error: Some(error),
        }
    }

    async fn enable_background(
        &mut self,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> MediaResult<MediaStream> {
        let raw = match self.raw.clone().filter(MediaStream::is_active) {
            Some(raw) => raw,
            None => acquire(capture, cancel).await?,
        };
        let mirror = self.settings.mirror_enabled;
        self.derive(raw, mirror, cancel).await
    }

    async fn disable_background(
        &mut self,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> MediaResult<MediaStream> {
        // Compositing must be fully torn down before the camera is reopened
        self.release_derived().await;
        self.output = None;

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(MediaError::Cancelled {
                    operation: "camera reacquire".to_string(),
                });
            }
            raw = capture.reacquire_video() => raw?,
        };
        let mirror = self.settings.mirror_enabled;
        self.derive(raw, mirror, cancel).await
    }

    async fn recover(
        &mut self,
        capture: &mut CaptureSource,
        cancel: &CancellationToken,
    ) -> Option<MediaStream> {
        let raw = match capture.stream().filter(|s| s.is_active()).cloned() {
            Some(raw) => raw,
            None => acquire(capture, cancel).await.ok()?,
        };
        let mirror = self.settings.mirror_enabled;

        match self.derive(raw.clone(), mirror, cancel).await {
            Ok(output) => return Some(output),
            Err(e) => warn!("Re-deriving previous state failed: {}", e),
        }

        // Last resort: the plain camera stream
        self.settings.background_removal_enabled = false;
        match self.derive(raw.clone(), mirror, cancel).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!("Falling back to raw capture: {}", e);
                self.output = Some(raw.clone());
                self.apply_track_state();
                Some(raw)
            }
        }
    }

    /// Change the background image used by the compositor
    pub fn select_background(&mut self, key: Option<String>) {
        self.settings.selected_background = key.clone();
        if let Some(compositor) = &self.compositor {
            compositor.select_background(key);
        }
    }

    /// Mute or unmute the audio tracks
    pub fn set_muted(&mut self, muted: bool) {
        self.settings.muted = muted;
        self.apply_track_state();
    }

    /// Enable or disable the outgoing video
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.settings.video_enabled = enabled;
        self.apply_track_state();
    }

    fn apply_track_state(&self) {
        for stream in self.raw.iter().chain(self.output.iter()) {
            for track in stream.audio_tracks() {
                track.set_enabled(!self.settings.muted);
            }
            for track in stream.video_tracks() {
                track.set_enabled(self.settings.video_enabled);
            }
        }
    }

    /// What the local preview should render
    pub fn preview(&self) -> Option<PreviewView> {
        if self.settings.background_removal_enabled {
            let stream = self.output.clone()?;
            return Some(PreviewView {
                stream,
                display_mirror: false,
            });
        }
        let stream = self.raw.clone()?;
        Some(PreviewView {
            stream,
            display_mirror: self.settings.mirror_enabled,
        })
    }

    async fn release_derived(&mut self) {
        if let Some(compositor) = self.compositor.take() {
            compositor.dispose().await;
        }
        if let Some(mirror) = self.mirror.take() {
            mirror.stop().await;
        }
    }

    /// Release every derived resource and forget the raw capture.
    ///
    /// Raw tracks belong to the capture source and are not stopped here.
    pub async fn release(&mut self) {
        self.release_derived().await;
        self.raw = None;
        self.output = None;
        self.settings.background_removal_enabled = false;
        self.settings.muted = false;
        self.settings.video_enabled = true;
        debug!("Stream pipeline released");
    }
}

async fn acquire(capture: &mut CaptureSource, cancel: &CancellationToken) -> MediaResult<MediaStream> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MediaError::Cancelled {
            operation: "camera acquire".to_string(),
        }),
        raw = capture.acquire() => raw,
    }
}
