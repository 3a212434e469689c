//! Segmentation model seam and the shared model slot
//!
//! The model itself is an external capability. This module defines how it is
//! loaded and invoked, and owns the single loaded instance: concurrent
//! requests wait for an in-flight load instead of starting another one.

use crate::error::{MediaError, MediaResult};
use crate::tracks::VideoFrame;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backbone architecture requested from the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// Light backbone suited to real-time use
    MobileNetV1,
    /// Heavy backbone with better edges
    ResNet50,
}

/// Model load configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Backbone architecture
    pub architecture: Architecture,
    /// Output stride (8, 16 or 32)
    pub output_stride: u8,
    /// Depth multiplier
    pub multiplier: f32,
    /// Weight quantization bytes
    pub quant_bytes: u8,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::MobileNetV1,
            output_stride: 16,
            multiplier: 0.75,
            quant_bytes: 2,
        }
    }
}

/// Internal resolution used by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Fastest
    Low,
    /// Balanced
    Medium,
    /// Slow
    High,
    /// Full input resolution
    Full,
}

/// Per-frame segmentation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentOptions {
    /// Internal resolution
    pub resolution: Resolution,
    /// Foreground probability threshold
    pub threshold: f32,
    /// Maximum number of people to detect
    pub max_detections: u32,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            resolution: Resolution::Medium,
            threshold: 0.7,
            max_detections: 1,
        }
    }
}

/// Per-pixel foreground mask. Non-zero values mark foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    /// Mask width
    pub width: u32,
    /// Mask height
    pub height: u32,
    /// One byte per pixel, row major
    pub data: Vec<u8>,
}

impl Mask {
    /// Whether the pixel at mask coordinates is foreground
    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .is_some_and(|v| *v != 0)
    }

    /// Sample the mask at coordinates of a target of another size
    pub fn sample(&self, x: u32, y: u32, target_width: u32, target_height: u32) -> bool {
        if target_width == 0 || target_height == 0 {
            return false;
        }
        let mx = (u64::from(x) * u64::from(self.width) / u64::from(target_width)) as u32;
        let my = (u64::from(y) * u64::from(self.height) / u64::from(target_height)) as u32;
        self.is_foreground(mx, my)
    }

    /// Mask alpha for drawing: 255 for foreground, 0 otherwise
    pub fn alpha(&self) -> Vec<u8> {
        self.data.iter().map(|v| if *v != 0 { 255 } else { 0 }).collect()
    }
}

/// A loaded segmentation model
#[async_trait]
pub trait SegmentationModel: Send + Sync {
    /// Compute the foreground mask for one frame
    async fn segment(&self, frame: &VideoFrame, options: &SegmentOptions) -> MediaResult<Mask>;
}

/// Loads segmentation models
#[async_trait]
pub trait SegmentationLoader: Send + Sync {
    /// Load a model. May take seconds.
    async fn load(&self, config: &SegmentationConfig) -> MediaResult<Arc<dyn SegmentationModel>>;
}

/// Model slot wait policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSlotConfig {
    /// How many times a waiter polls for an in-flight load
    pub wait_attempts: u32,
    /// Delay between polls, in milliseconds
    pub wait_interval_ms: u64,
}

impl Default for ModelSlotConfig {
    fn default() -> Self {
        Self {
            wait_attempts: 20,
            wait_interval_ms: 500,
        }
    }
}

enum SlotState {
    Empty,
    Loading,
    Ready(Arc<dyn SegmentationModel>),
}

/// Owner of the single loaded segmentation model
pub struct ModelSlot {
    loader: Arc<dyn SegmentationLoader>,
    model_config: SegmentationConfig,
    config: ModelSlotConfig,
    state: Mutex<SlotState>,
}

impl fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock() {
            SlotState::Empty => "empty",
            SlotState::Loading => "loading",
            SlotState::Ready(_) => "ready",
        };
        f.debug_struct("ModelSlot")
            .field("model_config", &self.model_config)
            .field("config", &self.config)
            .field("state", &state)
            .finish()
    }
}

/// Resets the slot if a load future is dropped before completing
struct LoadGuard<'a> {
    slot: &'a ModelSlot,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.state.lock() = SlotState::Empty;
        }
    }
}

impl ModelSlot {
    /// Create an empty slot
    pub fn new(
        loader: Arc<dyn SegmentationLoader>,
        model_config: SegmentationConfig,
        config: ModelSlotConfig,
    ) -> Self {
        Self {
            loader,
            model_config,
            config,
            state: Mutex::new(SlotState::Empty),
        }
    }

    /// Whether a model is loaded
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Ready(_))
    }

    /// Whether a load is in flight
    pub fn is_loading(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Loading)
    }

    /// Get the model, loading it if nobody has yet
    pub async fn get(&self) -> MediaResult<Arc<dyn SegmentationModel>> {
        let must_load = {
            let mut state = self.state.lock();
            match &*state {
                SlotState::Ready(model) => return Ok(model.clone()),
                SlotState::Loading => false,
                SlotState::Empty => {
                    *state = SlotState::Loading;
                    true
                }
            }
        };

        if must_load {
            self.load().await
        } else {
            self.wait_for_load().await
        }
    }

    async fn load(&self) -> MediaResult<Arc<dyn SegmentationModel>> {
        let mut guard = LoadGuard {
            slot: self,
            armed: true,
        };
        info!("Loading segmentation model ({:?})", self.model_config.architecture);

        let result = self.loader.load(&self.model_config).await;
        guard.armed = false;

        let mut state = self.state.lock();
        match result {
            Ok(model) => {
                info!("Segmentation model loaded");
                *state = SlotState::Ready(model.clone());
                Ok(model)
            }
            Err(e) => {
                warn!("Segmentation model load failed: {}", e);
                *state = SlotState::Empty;
                Err(e)
            }
        }
    }

    async fn wait_for_load(&self) -> MediaResult<Arc<dyn SegmentationModel>> {
        debug!("Segmentation model load in flight, waiting");
        let interval = Duration::from_millis(self.config.wait_interval_ms);

        for _ in 0..self.config.wait_attempts {
            tokio::time::sleep(interval).await;
            match &*self.state.lock() {
                SlotState::Ready(model) => return Ok(model.clone()),
                SlotState::Loading => continue,
                SlotState::Empty => {
                    return Err(MediaError::ModelLoadFailed {
                        reason: "in-flight load failed".to_string(),
                    });
                }
            }
        }

        Err(MediaError::ModelLoadTimeout {
            attempts: self.config.wait_attempts,
        })
    }

    /// Drop the loaded model
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Ready(_)) {
            info!("Disposing segmentation model");
            *state = SlotState::Empty;
        }
    }
}

/// Reference model that marks a fixed centred rectangle as foreground.
///
/// Stands in for a real person segmenter in demos and tests.
#[derive(Debug, Clone)]
pub struct FixedRegionModel {
    /// Fraction of the width and height covered by the foreground region
    pub coverage: f32,
}

impl Default for FixedRegionModel {
    fn default() -> Self {
        Self { coverage: 0.5 }
    }
}

#[async_trait]
impl SegmentationModel for FixedRegionModel {
    async fn segment(&self, frame: &VideoFrame, _options: &SegmentOptions) -> MediaResult<Mask> {
        if frame.width == 0 || frame.height == 0 {
            return Err(MediaError::SegmentationFailed {
                reason: "empty frame".to_string(),
            });
        }
        let coverage = self.coverage.clamp(0.0, 1.0);
        let region_w = (frame.width as f32 * coverage) as u32;
        let region_h = (frame.height as f32 * coverage) as u32;
        let left = (frame.width - region_w) / 2;
        let top = (frame.height - region_h) / 2;

        let mut data = vec![0u8; frame.width as usize * frame.height as usize];
        for y in top..top + region_h {
            for x in left..left + region_w {
                data[y as usize * frame.width as usize + x as usize] = 1;
            }
        }
        Ok(Mask {
            width: frame.width,
            height: frame.height,
            data,
        })
    }
}

/// Loader handing out a prepared model, optionally after a delay
pub struct StaticLoader {
    model: Arc<dyn SegmentationModel>,
    delay: Duration,
    loads: std::sync::atomic::AtomicU32,
}

impl StaticLoader {
    /// Loader that returns `model` immediately
    pub fn new(model: Arc<dyn SegmentationModel>) -> Self {
        Self {
            model,
            delay: Duration::ZERO,
            loads: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Simulate a slow download
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of loads performed
    pub fn load_count(&self) -> u32 {
        self.loads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentationLoader for StaticLoader {
    async fn load(&self, _config: &SegmentationConfig) -> MediaResult<Arc<dyn SegmentationModel>> {
        self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_config() {
        let config = SegmentationConfig::default();
        assert_eq!(config.architecture, Architecture::MobileNetV1);
        assert_eq!(config.output_stride, 16);
        assert_eq!(config.multiplier, 0.75);
        assert_eq!(config.quant_bytes, 2);

        let options = SegmentOptions::default();
        assert_eq!(options.resolution, Resolution::Medium);
        assert_eq!(options.threshold, 0.7);
        assert_eq!(options.max_detections, 1);
    }

    #[test]
    fn test_mask_sampling() {
        let mask = Mask {
            width: 2,
            height: 2,
            data: vec![1, 0, 0, 1],
        };
        assert!(mask.sample(0, 0, 4, 4));
        assert!(mask.sample(1, 1, 4, 4));
        assert!(!mask.sample(3, 0, 4, 4));
        assert!(mask.sample(3, 3, 4, 4));
        assert_eq!(mask.alpha(), vec![255, 0, 0, 255]);
    }

    #[tokio::test]
    async fn test_fixed_region_model_centres_foreground() {
        let frame = VideoFrame::solid(10, 10, [0, 0, 0, 255], 0);
        let mask = FixedRegionModel::default()
            .segment(&frame, &SegmentOptions::default())
            .await
            .unwrap();
        assert!(mask.is_foreground(5, 5));
        assert!(!mask.is_foreground(0, 0));
        assert!(!mask.is_foreground(9, 9));
    }
}
