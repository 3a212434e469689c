//! Virtual background compositing
//!
//! Every frame the compositor asks the segmentation model for a fresh mask,
//! paints the selected background into the output surface and then paints
//! the masked foreground on top. The output surface feeds a derived video
//! track that is published in place of the camera track.
//!
//! A failed segmentation skips one frame. A frame that cannot be read or
//! composited stops the loop and is reported through [`BackgroundCompositor::faults`].

use crate::error::{MediaError, MediaResult};
use crate::segmentation::{Mask, SegmentOptions, SegmentationModel};
use crate::tracks::{MediaStream, MediaTrack, TrackSettings, VideoFrame};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Background shown when nothing has been selected
pub const DEFAULT_BACKGROUND: &str = "/background/livingroom.jpg";

/// Backgrounds bundled with the application
pub const BUNDLED_BACKGROUNDS: [&str; 4] = [
    "/background/livingroom.jpg",
    "/background/livingroom2.jpg",
    "/background/livingroom3.jpg",
    "/background/office.jpg",
];

/// Compositor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Output surface width
    pub width: u32,
    /// Output surface height
    pub height: u32,
    /// Render loop rate
    pub fps: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl CompositorConfig {
    /// Validate configuration
    pub fn validate(&self) -> MediaResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: "Invalid compositor surface size".to_string(),
            });
        }
        if self.fps == 0 || self.fps > 120 {
            return Err(MediaError::InvalidConfiguration {
                message: "Invalid compositor framerate".to_string(),
            });
        }
        Ok(())
    }
}

/// Decoded background images keyed by reference
#[derive(Debug, Default)]
pub struct BackgroundLibrary {
    images: RwLock<HashMap<String, Arc<RgbaImage>>>,
}

impl BackgroundLibrary {
    /// Empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode images from disk. Failures are returned and the rest are still loaded.
    pub async fn preload<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<MediaError> {
        let mut failures = Vec::new();
        for path in paths {
            let path = path.as_ref().to_path_buf();
            let key = path.to_string_lossy().to_string();
            let decoded = tokio::task::spawn_blocking({
                let path = path.clone();
                move || image::open(&path).map(|img| img.to_rgba8())
            })
            .await;

            match decoded {
                Ok(Ok(img)) => {
                    debug!("Preloaded background {}", key);
                    self.insert(&key, img);
                }
                Ok(Err(e)) => {
                    warn!("Failed to load background {}: {}", key, e);
                    failures.push(MediaError::ImageLoad {
                        path: key,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    failures.push(MediaError::ImageLoad {
                        path: key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    /// Register a decoded image
    pub fn insert(&self, key: &str, image: RgbaImage) {
        self.images.write().insert(key.to_string(), Arc::new(image));
    }

    /// Register a solid colour background
    pub fn insert_color(&self, key: &str, rgba: [u8; 4]) {
        self.insert(key, RgbaImage::from_pixel(1, 1, Rgba(rgba)));
    }

    /// Look up a background
    pub fn get(&self, key: &str) -> Option<Arc<RgbaImage>> {
        self.images.read().get(key).cloned()
    }

    /// Whether a background is available
    pub fn contains(&self, key: &str) -> bool {
        self.images.read().contains_key(key)
    }

    /// Registered keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.images.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Counters for compositing resources, used to check that nothing leaks
#[derive(Debug, Default)]
pub struct ResourceCounters {
    surfaces_allocated: AtomicU64,
    surfaces_released: AtomicU64,
    loops_started: AtomicU64,
    loops_stopped: AtomicU64,
    frames_rendered: AtomicU64,
    frames_skipped: AtomicU64,
}

/// Snapshot of [`ResourceCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStats {
    /// Surfaces ever allocated
    pub surfaces_allocated: u64,
    /// Surfaces released
    pub surfaces_released: u64,
    /// Render loops started
    pub loops_started: u64,
    /// Render loops stopped
    pub loops_stopped: u64,
    /// Frames composited
    pub frames_rendered: u64,
    /// Frames skipped after a segmentation failure
    pub frames_skipped: u64,
}

impl ResourceStats {
    /// Surfaces currently held
    pub fn live_surfaces(&self) -> u64 {
        self.surfaces_allocated - self.surfaces_released
    }

    /// Render loops currently running
    pub fn live_loops(&self) -> u64 {
        self.loops_started - self.loops_stopped
    }
}

impl ResourceCounters {
    /// Take a snapshot
    pub fn snapshot(&self) -> ResourceStats {
        ResourceStats {
            surfaces_allocated: self.surfaces_allocated.load(Ordering::SeqCst),
            surfaces_released: self.surfaces_released.load(Ordering::SeqCst),
            loops_started: self.loops_started.load(Ordering::SeqCst),
            loops_stopped: self.loops_stopped.load(Ordering::SeqCst),
            frames_rendered: self.frames_rendered.load(Ordering::SeqCst),
            frames_skipped: self.frames_skipped.load(Ordering::SeqCst),
        }
    }
}

/// Off-screen RGBA surface. Released when dropped.
struct Surface {
    pixels: RgbaImage,
    counters: Arc<ResourceCounters>,
}

impl Surface {
    fn new(width: u32, height: u32, counters: Arc<ResourceCounters>) -> Self {
        counters.surfaces_allocated.fetch_add(1, Ordering::SeqCst);
        Self {
            pixels: RgbaImage::new(width, height),
            counters,
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.counters.surfaces_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Paint `background` and then the masked `foreground` into `surface`.
///
/// `foreground` must already match the surface size. The mask is sampled to
/// the surface size.
pub fn composite(
    foreground: &RgbaImage,
    mask: &Mask,
    background: Option<&RgbaImage>,
    surface: &mut RgbaImage,
) -> MediaResult<()> {
    let (width, height) = surface.dimensions();
    if foreground.dimensions() != (width, height) {
        return Err(MediaError::SurfaceFailure {
            reason: format!(
                "foreground is {:?}, surface is {:?}",
                foreground.dimensions(),
                (width, height)
            ),
        });
    }

    match background {
        Some(bg) if bg.dimensions() == (width, height) => surface.copy_from_slice(bg.as_raw()),
        Some(bg) => *surface = imageops::resize(bg, width, height, FilterType::Triangle),
        None => surface.fill(0),
    }
    for (x, y, px) in surface.enumerate_pixels_mut() {
        px.0[3] = 255;
        if mask.sample(x, y, width, height) {
            *px = *foreground.get_pixel(x, y);
        }
    }
    Ok(())
}

struct RenderState {
    source: MediaTrack,
    output: MediaTrack,
    model: Arc<dyn SegmentationModel>,
    library: Arc<BackgroundLibrary>,
    selected: Arc<RwLock<Option<String>>>,
    options: SegmentOptions,
    counters: Arc<ResourceCounters>,
    surface: Surface,
    background: Option<(String, Surface)>,
    fault: watch::Sender<Option<MediaError>>,
}

impl RenderState {
    fn prepare_background(&mut self) {
        let Some(key) = self.selected.read().clone() else {
            self.background = None;
            return;
        };
        if self.background.as_ref().is_some_and(|(k, _)| *k == key) {
            return;
        }
        let Some(image) = self.library.get(&key) else {
            debug!("Background {} not loaded, drawing black", key);
            self.background = None;
            return;
        };
        let (w, h) = self.surface.pixels.dimensions();
        let mut surface = Surface::new(w, h, self.counters.clone());
        surface.pixels = imageops::resize(image.as_ref(), w, h, FilterType::Triangle);
        debug!("Prepared background {} at {}x{}", key, w, h);
        self.background = Some((key, surface));
    }

    fn fit_source(&self, frame: &VideoFrame) -> MediaResult<RgbaImage> {
        let (w, h) = self.surface.pixels.dimensions();
        let image = frame.to_image()?;
        if image.dimensions() == (w, h) {
            Ok(image)
        } else {
            Ok(imageops::resize(&image, w, h, FilterType::Triangle))
        }
    }

    /// Render one frame. Returns the error that makes further frames pointless.
    async fn render(&mut self, frame: VideoFrame) -> MediaResult<()> {
        let source = self.fit_source(&frame)?;

        let input = VideoFrame::from_image(source.clone(), frame.timestamp);
        let mask = match self.model.segment(&input, &self.options).await {
            Ok(mask) => mask,
            Err(e) => {
                warn!("Segmentation failed, skipping frame: {}", e);
                self.counters.frames_skipped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        };

        self.prepare_background();
        let background = self.background.as_ref().map(|(_, s)| &s.pixels);
        composite(&source, &mask, background, &mut self.surface.pixels)?;

        self.counters.frames_rendered.fetch_add(1, Ordering::SeqCst);
        self.output
            .push_frame(VideoFrame::from_image(self.surface.pixels.clone(), frame.timestamp));
        Ok(())
    }
}

/// Running background compositor
pub struct BackgroundCompositor {
    output: MediaStream,
    derived: MediaTrack,
    selected: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    faults: watch::Receiver<Option<MediaError>>,
}

impl std::fmt::Debug for BackgroundCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundCompositor")
            .field("output", &self.output.id())
            .field("selected", &*self.selected.read())
            .field("running", &self.task.is_some())
            .finish()
    }
}

/// Everything the compositor needs besides its source
#[derive(Clone)]
pub struct CompositorContext {
    /// Loaded segmentation model
    pub model: Arc<dyn SegmentationModel>,
    /// Background images
    pub library: Arc<BackgroundLibrary>,
    /// Resource accounting
    pub counters: Arc<ResourceCounters>,
    /// Surface and loop configuration
    pub config: CompositorConfig,
    /// Per-frame segmentation options
    pub options: SegmentOptions,
}

impl BackgroundCompositor {
    /// Start compositing `source`. Audio tracks of `source` are carried over.
    pub fn start(
        source: &MediaStream,
        context: CompositorContext,
        selected: Option<String>,
        parent: &CancellationToken,
    ) -> MediaResult<Self> {
        let video = source.video_track().ok_or(MediaError::CaptureNotActive)?;
        let config = &context.config;

        let derived = MediaTrack::video(
            "background removed",
            TrackSettings {
                width: Some(config.width),
                height: Some(config.height),
                device_id: video.settings().device_id,
                facing_mode: video.settings().facing_mode,
            },
        );
        derived.set_enabled(video.is_enabled());

        let mut tracks = vec![derived.clone()];
        tracks.extend(source.audio_tracks());
        let output = MediaStream::new(tracks);

        let selected = Arc::new(RwLock::new(selected));
        let cancel = parent.child_token();
        let (fault, faults) = watch::channel(None);
        let state = RenderState {
            source: video,
            output: derived.clone(),
            model: context.model,
            library: context.library,
            selected: selected.clone(),
            options: context.options,
            surface: Surface::new(config.width, config.height, context.counters.clone()),
            counters: context.counters,
            background: None,
            fault,
        };

        let interval = Duration::from_millis(1_000 / u64::from(config.fps.max(1)));
        let task = tokio::spawn(render_loop(state, interval, cancel.clone()));

        info!(
            "Background compositor started at {}x{} {} fps",
            config.width, config.height, config.fps
        );
        Ok(Self {
            output,
            derived,
            selected,
            cancel,
            task: Some(task),
            faults,
        })
    }

    /// Fatal render failure, set once the loop has stopped because of it.
    ///
    /// The sender goes away when the loop ends, so waiting on a compositor
    /// that is disposed cleanly returns an error instead of hanging.
    pub fn faults(&self) -> watch::Receiver<Option<MediaError>> {
        self.faults.clone()
    }

    /// Composited stream
    pub fn output(&self) -> &MediaStream {
        &self.output
    }

    /// Change the background. Takes effect on the next frame.
    pub fn select_background(&self, key: Option<String>) {
        *self.selected.write() = key;
    }

    /// Currently selected background
    pub fn selected_background(&self) -> Option<String> {
        self.selected.read().clone()
    }

    /// Stop the render loop, release surfaces and end the derived track
    pub async fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Compositor render loop ended abnormally: {}", e);
            }
        }
        self.derived.stop();
        debug!("Background compositor disposed");
    }
}

impl Drop for BackgroundCompositor {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.derived.stop();
    }
}

async fn render_loop(mut state: RenderState, interval: Duration, cancel: CancellationToken) {
    state.counters.loops_started.fetch_add(1, Ordering::SeqCst);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !state.output.is_live() {
            break;
        }
        let Some(frame) = state.source.latest_frame() else {
            continue;
        };

        let rendered = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            rendered = state.render(frame) => rendered,
        };
        if let Err(e) = rendered {
            error!("Compositor stopped: {}", e);
            state.fault.send_replace(Some(e));
            break;
        }
    }

    state.counters.loops_stopped.fetch_add(1, Ordering::SeqCst);
    debug!("Compositor render loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_mask(width: u32, height: u32, value: u8) -> Mask {
        Mask {
            width,
            height,
            data: vec![value; (width * height) as usize],
        }
    }

    #[test]
    fn test_composite_draws_background_under_mask() {
        let foreground = RgbaImage::from_pixel(4, 4, Rgba([200, 0, 0, 255]));
        let background = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 200, 255]));
        let mut mask = full_mask(4, 4, 0);
        mask.data[0] = 1;
        let mut surface = RgbaImage::new(4, 4);

        composite(&foreground, &mask, Some(&background), &mut surface).unwrap();

        assert_eq!(surface.get_pixel(0, 0).0, [200, 0, 0, 255]);
        assert_eq!(surface.get_pixel(3, 3).0, [0, 0, 200, 255]);
    }

    #[test]
    fn test_composite_scales_background() {
        let foreground = RgbaImage::from_pixel(4, 4, Rgba([1, 1, 1, 255]));
        let background = RgbaImage::from_pixel(1, 1, Rgba([9, 9, 9, 255]));
        let mut surface = RgbaImage::new(4, 4);

        composite(&foreground, &full_mask(2, 2, 0), Some(&background), &mut surface).unwrap();
        assert_eq!(surface.get_pixel(2, 2).0, [9, 9, 9, 255]);
    }

    #[test]
    fn test_composite_rejects_mismatched_foreground() {
        let foreground = RgbaImage::new(2, 2);
        let mut surface = RgbaImage::new(4, 4);
        let result = composite(&foreground, &full_mask(4, 4, 1), None, &mut surface);
        assert!(matches!(result, Err(MediaError::SurfaceFailure { .. })));
    }

    #[test]
    fn test_library_colour_backgrounds() {
        let library = BackgroundLibrary::new();
        library.insert_color("green", [0, 255, 0, 255]);
        assert!(library.contains("green"));
        assert_eq!(library.keys(), vec!["green".to_string()]);
        assert_eq!(library.get("green").unwrap().get_pixel(0, 0).0, [0, 255, 0, 255]);
    }

    #[tokio::test]
    async fn test_preload_reports_missing_files() {
        let library = BackgroundLibrary::new();
        let failures = library.preload(&["/definitely/not/here.jpg"]).await;
        assert_eq!(failures.len(), 1);
        assert!(library.keys().is_empty());
    }
}
