//! Integration tests for the stream pipeline
//!
//! These drive the pipeline against the synthetic device layer and check the
//! properties the call layer relies on: exactly one live camera track, audio
//! carried through every derivation and no compositing resources left behind.

use async_trait::async_trait;
use peerlink_media::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// HELPERS
// ============================================================================

struct FailingLoader;

#[async_trait]
impl SegmentationLoader for FailingLoader {
    async fn load(&self, _config: &SegmentationConfig) -> MediaResult<Arc<dyn SegmentationModel>> {
        Err(MediaError::ModelLoadFailed {
            reason: "weights unavailable".to_string(),
        })
    }
}

/// Fails every `every`-th frame, otherwise behaves like the fixed-region model
struct FlakyModel {
    calls: AtomicUsize,
    every: usize,
}

#[async_trait]
impl SegmentationModel for FlakyModel {
    async fn segment(&self, frame: &VideoFrame, options: &SegmentOptions) -> MediaResult<Mask> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % self.every == 0 {
            return Err(MediaError::SegmentationFailed {
                reason: format!("frame {} dropped", call),
            });
        }
        FixedRegionModel::default().segment(frame, options).await
    }
}

fn model_slot() -> Arc<ModelSlot> {
    let loader = StaticLoader::new(Arc::new(FixedRegionModel::default()));
    Arc::new(ModelSlot::new(
        Arc::new(loader),
        SegmentationConfig::default(),
        ModelSlotConfig::default(),
    ))
}

fn library() -> Arc<BackgroundLibrary> {
    let library = BackgroundLibrary::new();
    library.insert_color(DEFAULT_BACKGROUND, [0, 0, 255, 255]);
    Arc::new(library)
}

fn small_config() -> PipelineConfig {
    PipelineConfig {
        compositor: CompositorConfig {
            width: 32,
            height: 24,
            fps: 30,
        },
        ..Default::default()
    }
}

fn capture(devices: &Arc<SyntheticDevices>) -> CaptureSource {
    CaptureSource::new(devices.clone(), CaptureConfig::default())
}

fn live_video_count(devices: &SyntheticDevices) -> usize {
    devices
        .live_tracks()
        .iter()
        .filter(|t| t.kind() == TrackKind::Video)
        .count()
}

// ============================================================================
// DERIVATION TESTS
// ============================================================================

#[tokio::test]
async fn test_mirrored_output_shares_audio() {
    let devices = Arc::new(SyntheticDevices::new());
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();
    let cancel = CancellationToken::new();

    let mut pipeline = StreamPipeline::new(small_config(), model_slot(), library());
    let output = pipeline.derive(raw.clone(), true, &cancel).await.unwrap();

    let raw_video = raw.video_track().unwrap();
    let out_video = output.video_track().unwrap();
    assert!(!out_video.same_track(&raw_video));
    assert_eq!(
        out_video.latest_frame().unwrap(),
        flip_horizontal(&raw_video.latest_frame().unwrap()).unwrap()
    );
    assert!(output.audio_track().unwrap().same_track(&raw.audio_track().unwrap()));

    let preview = pipeline.preview().unwrap();
    assert!(preview.stream.same_tracks(&raw));
    assert!(preview.display_mirror);

    pipeline.release().await;
    assert!(!out_video.is_live());
    assert!(raw_video.is_live());
}

#[tokio::test]
async fn test_unmirrored_output_is_raw() {
    let devices = Arc::new(SyntheticDevices::front_and_back());
    let mut source = capture(&devices);
    source.acquire().await.unwrap();
    let raw = source.switch_camera().await.unwrap();
    assert!(!should_mirror(source.current_device(), source.has_multiple_cameras()));

    let mut pipeline = StreamPipeline::new(small_config(), model_slot(), library());
    let output = pipeline.derive(raw.clone(), false, &CancellationToken::new()).await.unwrap();

    assert!(output.same_tracks(&raw));
    assert!(!pipeline.preview().unwrap().display_mirror);
    assert_eq!(live_video_count(&devices), 1);
}

// ============================================================================
// BACKGROUND REMOVAL TESTS
// ============================================================================

#[tokio::test]
async fn test_background_toggle_round_trip_leaves_one_camera() {
    let devices = Arc::new(SyntheticDevices::new());
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();
    let audio = raw.audio_track().unwrap();
    let cancel = CancellationToken::new();

    let mut pipeline = StreamPipeline::new(small_config(), model_slot(), library());
    pipeline.derive(raw, true, &cancel).await.unwrap();
    pipeline.set_muted(true);

    for round in 0..2 {
        let on = pipeline.set_background_removal(true, &mut source, &cancel).await;
        assert!(!on.reverted(), "round {}", round);
        assert!(on.enabled);
        let composited = on.output.unwrap();
        assert_eq!(composited.video_track().unwrap().label(), "background removed");
        assert!(!composited.audio_track().unwrap().is_enabled(), "muted while on, round {}", round);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = pipeline.resource_stats();
        assert_eq!(stats.live_loops(), 1);
        assert!(stats.live_surfaces() >= 1);
        assert!(stats.frames_rendered > 0);
        assert!(composited.video_track().unwrap().latest_frame().is_some());
        assert_eq!(live_video_count(&devices), 1);

        let off = pipeline.set_background_removal(false, &mut source, &cancel).await;
        assert!(!off.reverted(), "round {}", round);
        assert!(!off.enabled);
        let plain = off.output.unwrap();

        let stats = pipeline.resource_stats();
        assert_eq!(stats.live_loops(), 0);
        assert_eq!(stats.live_surfaces(), 0);
        assert!(!composited.video_track().unwrap().is_live());

        assert_eq!(live_video_count(&devices), 1);
        let out_audio = plain.audio_track().unwrap();
        assert!(out_audio.same_track(&audio));
        assert!(!out_audio.is_enabled(), "muted while off, round {}", round);
    }
}

#[tokio::test]
async fn test_unreadable_frame_stops_compositor_and_reverts() {
    // Rear camera first, so the compositor reads the raw track directly
    let devices = Arc::new(SyntheticDevices::with_cameras(vec![
        MediaDeviceInfo::camera("back", "Back Camera", None),
        MediaDeviceInfo::camera("front", "Front Camera", Some(FacingMode::User)),
    ]));
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();
    let cancel = CancellationToken::new();

    let mut pipeline = StreamPipeline::new(small_config(), model_slot(), library());
    pipeline.derive(raw.clone(), false, &cancel).await.unwrap();
    let on = pipeline.set_background_removal(true, &mut source, &cancel).await;
    assert!(on.enabled);
    let composited = on.output.unwrap();
    let (stream_id, mut faults) = pipeline.compositor_faults().expect("compositor running");
    assert_eq!(stream_id, composited.id());

    raw.video_track().unwrap().push_frame(VideoFrame {
        width: 32,
        height: 24,
        data: vec![0u8; 3].into(),
        timestamp: 1,
    });
    let error = tokio::time::timeout(Duration::from_secs(2), faults.wait_for(Option::is_some))
        .await
        .expect("fault reported")
        .expect("compositor still owns its sender")
        .clone()
        .unwrap();
    assert!(matches!(error, MediaError::InvalidFrameData { expected: 3072, actual: 3 }));

    let outcome = pipeline
        .handle_compositor_fault(&stream_id, error, &mut source, &cancel)
        .await
        .expect("fault belongs to the active compositor");
    assert!(outcome.reverted());
    assert!(!outcome.enabled);
    assert!(!pipeline.settings().background_removal_enabled);
    assert!(outcome.output.unwrap().same_tracks(&raw));
    assert!(!composited.video_track().unwrap().is_live());
    assert_eq!(pipeline.resource_stats().live_loops(), 0);
    assert_eq!(live_video_count(&devices), 1);

    // A second report for the same compositor changes nothing
    let stale = MediaError::SurfaceFailure {
        reason: "late".to_string(),
    };
    assert!(pipeline
        .handle_compositor_fault(&stream_id, stale, &mut source, &cancel)
        .await
        .is_none());
}

#[tokio::test]
async fn test_transient_segmentation_failures_skip_frames() {
    let devices = Arc::new(SyntheticDevices::new());
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();
    let cancel = CancellationToken::new();
    let counters = Arc::new(ResourceCounters::default());

    let compositor = BackgroundCompositor::start(
        &raw,
        CompositorContext {
            model: Arc::new(FlakyModel {
                calls: AtomicUsize::new(0),
                every: 3,
            }),
            library: library(),
            counters: counters.clone(),
            config: small_config().compositor,
            options: SegmentOptions::default(),
        },
        Some(DEFAULT_BACKGROUND.to_string()),
        &cancel,
    )
    .unwrap();
    let faults = compositor.faults();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let first = counters.snapshot();
    assert!(first.frames_skipped > 0);
    assert!(first.frames_rendered > 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = counters.snapshot();
    assert!(second.frames_rendered > first.frames_rendered);
    assert!(second.frames_skipped > first.frames_skipped);
    assert_eq!(second.live_loops(), 1);
    assert!(faults.borrow().is_none());
    assert!(compositor.output().video_track().unwrap().is_live());

    compositor.dispose().await;
    assert_eq!(counters.snapshot().live_loops(), 0);
}

#[tokio::test]
async fn test_failed_model_load_reverts_toggle() {
    let devices = Arc::new(SyntheticDevices::new());
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();
    let cancel = CancellationToken::new();

    let slot = Arc::new(ModelSlot::new(
        Arc::new(FailingLoader),
        SegmentationConfig::default(),
        ModelSlotConfig::default(),
    ));
    let mut pipeline = StreamPipeline::new(small_config(), slot, library());
    pipeline.derive(raw, true, &cancel).await.unwrap();

    let outcome = pipeline.set_background_removal(true, &mut source, &cancel).await;

    assert!(outcome.reverted());
    assert!(!outcome.enabled);
    assert!(!pipeline.settings().background_removal_enabled);
    assert!(matches!(outcome.error, Some(MediaError::ModelLoadFailed { .. })));
    let output = outcome.output.unwrap();
    assert!(output.video_track().unwrap().is_live());
    assert!(output.has_audio());
    assert_eq!(pipeline.resource_stats().live_loops(), 0);
}

#[tokio::test]
async fn test_cancelled_toggle_publishes_nothing() {
    let devices = Arc::new(SyntheticDevices::new());
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();

    let mut pipeline = StreamPipeline::new(small_config(), model_slot(), library());
    pipeline.derive(raw, true, &CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = pipeline.set_background_removal(true, &mut source, &cancel).await;

    assert!(outcome.output.is_none());
    assert!(matches!(outcome.error, Some(MediaError::Cancelled { .. })));
    assert!(!pipeline.settings().background_removal_enabled);
}

#[tokio::test]
async fn test_background_selection_reaches_live_compositor() {
    let devices = Arc::new(SyntheticDevices::new());
    let mut source = capture(&devices);
    let raw = source.acquire().await.unwrap();
    let cancel = CancellationToken::new();
    let library = library();
    library.insert_color("/background/office.jpg", [0, 255, 0, 255]);

    let mut pipeline = StreamPipeline::new(small_config(), model_slot(), library);
    pipeline.derive(raw, false, &cancel).await.unwrap();
    let outcome = pipeline.set_background_removal(true, &mut source, &cancel).await;
    let output = outcome.output.unwrap();

    pipeline.select_background(Some("/background/office.jpg".to_string()));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let frame = output.video_track().unwrap().latest_frame().unwrap();
    // FixedRegionModel keeps the centre, so the corner shows the background
    assert_eq!(frame.pixel(0, 0), Some([0, 255, 0, 255]));
    assert!(!pipeline.preview().unwrap().display_mirror);

    pipeline.release().await;
    assert_eq!(pipeline.resource_stats().live_surfaces(), 0);
}

// ============================================================================
// MODEL SLOT TESTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_model_requests_share_one_load() {
    let loader = Arc::new(
        StaticLoader::new(Arc::new(FixedRegionModel::default())).with_delay(Duration::from_secs(2)),
    );
    let slot = Arc::new(ModelSlot::new(
        loader.clone(),
        SegmentationConfig::default(),
        ModelSlotConfig::default(),
    ));

    let (a, b) = tokio::join!(slot.get(), slot.get());
    tokio_test::assert_ok!(a);
    tokio_test::assert_ok!(b);
    assert_eq!(loader.load_count(), 1);
    assert!(slot.is_loaded());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_times_out_on_slow_load() {
    let loader = Arc::new(
        StaticLoader::new(Arc::new(FixedRegionModel::default())).with_delay(Duration::from_secs(60)),
    );
    let slot = Arc::new(ModelSlot::new(
        loader,
        SegmentationConfig::default(),
        ModelSlotConfig {
            wait_attempts: 3,
            wait_interval_ms: 100,
        },
    ));

    let first = slot.clone();
    let _loading = tokio::spawn(async move { first.get().await });
    while !slot.is_loading() {
        tokio::task::yield_now().await;
    }

    let result = slot.get().await;
    assert!(matches!(result, Err(MediaError::ModelLoadTimeout { attempts: 3 })));
}
