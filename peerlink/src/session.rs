//! Session orchestration
//!
//! A [`Session`] composes the transport, the capture source, the stream
//! pipeline, the screen-share manager and the call state machine. All
//! asynchronous notifications (transport, data connection, call, watchdog,
//! share and worker events) are funnelled into one signal queue that a
//! single pump task drains in order.

use crate::call::{CallController, CallEffect, CallInput, CallNotice, CallSession, CallStatus};
use crate::config::SessionConfig;
use crate::event::{Event, EventBus, EventStream};
use crate::peer::PeerState;
use crate::screen_share::{ArmedTicks, ScreenShareManager};
use crate::transport::{CallEvent, CallHandle, SessionTransport, TransportEvent};
use parking_lot::Mutex;
use peerlink_core::{AppMessage, ConnectionEvent, PeerIdentity, PeerLinkError, PeerLinkResult};
use peerlink_diagnostics::{LivenessMonitor, LivenessReport};
use peerlink_keepalive::WorkerEvent;
use peerlink_media::{
    object_fit, should_mirror, BackgroundLibrary, CaptureSource, DisplayConstraints, FitContext,
    FixedRegionModel, MediaDevices, MediaError, MediaStream, ModelSlot, ObjectFit, PreviewView, ResourceStats,
    SegmentationLoader, StaticLoader, StreamPipeline, TrackKind, VideoMetrics,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything that can wake the session up
#[derive(Debug)]
pub(crate) enum Signal {
    Transport(TransportEvent),
    Connection { generation: u64, event: ConnectionEvent },
    Call { epoch: u64, event: CallEvent },
    Watchdog { epoch: u64 },
    ShareEnded { share_id: u64 },
    KeepAliveTick { timestamp: u64 },
    CompositorFailed { stream_id: String, error: MediaError },
}

pub(crate) struct MediaState {
    pub(crate) capture: CaptureSource,
    pub(crate) pipeline: StreamPipeline,
    pub(crate) share: ScreenShareManager,
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<dyn SessionTransport>,
    pub(crate) events: EventBus,
    pub(crate) identity: Mutex<Option<PeerIdentity>>,
    pub(crate) peer: Mutex<PeerState>,
    pub(crate) call: Mutex<CallController>,
    pub(crate) media: tokio::sync::Mutex<MediaState>,
    pub(crate) models: Arc<ModelSlot>,
    pub(crate) library: Arc<BackgroundLibrary>,
    pub(crate) loading: AtomicBool,
    pub(crate) pipeline_cancel: Mutex<CancellationToken>,
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) liveness: LivenessMonitor,
}

/// Clears the loading flag when a serialized media operation finishes
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fluent builder for a [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn SessionTransport>>,
    devices: Option<Arc<dyn MediaDevices>>,
    loader: Option<Arc<dyn SegmentationLoader>>,
    library: Option<Arc<BackgroundLibrary>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Builder with default configuration
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            transport: None,
            devices: None,
            loader: None,
            library: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the session transport (required)
    pub fn transport(mut self, transport: Arc<dyn SessionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the capture device layer (required)
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the segmentation model loader
    pub fn segmentation_loader(mut self, loader: Arc<dyn SegmentationLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Share a background library, for instance one with solid colours registered
    pub fn backgrounds(mut self, library: Arc<BackgroundLibrary>) -> Self {
        self.library = Some(library);
        self
    }

    /// Use the low power preset
    pub fn low_power(mut self) -> Self {
        self.config = SessionConfig::low_power();
        self
    }

    /// Build the session. Must be called inside a tokio runtime.
    pub fn build(self) -> PeerLinkResult<Session> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| PeerLinkError::Initialization {
            reason: format!("a tokio runtime is required: {}", e),
        })?;

        let transport = self.transport.ok_or_else(|| PeerLinkError::InvalidConfiguration {
            field: "transport".to_string(),
            reason: "a session transport is required".to_string(),
        })?;
        let devices = self.devices.ok_or_else(|| PeerLinkError::InvalidConfiguration {
            field: "devices".to_string(),
            reason: "a capture device layer is required".to_string(),
        })?;
        let loader = self.loader.unwrap_or_else(|| {
            debug!("No segmentation loader supplied, using the fixed region model");
            Arc::new(StaticLoader::new(Arc::new(FixedRegionModel::default())))
        });
        let library = self.library.unwrap_or_default();

        let config = self.config;
        let models = Arc::new(ModelSlot::new(
            loader,
            config.segmentation.clone(),
            config.model_slot.clone(),
        ));
        let mut pipeline = StreamPipeline::new(config.pipeline.clone(), models.clone(), library.clone());
        pipeline.select_background(config.default_background.clone());

        let (signals, signal_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            transport,
            events: EventBus::default(),
            identity: Mutex::new(None),
            peer: Mutex::new(PeerState::default()),
            call: Mutex::new(CallController::new(config.call.timeout())),
            media: tokio::sync::Mutex::new(MediaState {
                capture: CaptureSource::new(devices, config.capture.clone()),
                pipeline,
                share: ScreenShareManager::new(config.keep_alive.clone()),
            }),
            models,
            library,
            loading: AtomicBool::new(false),
            pipeline_cancel: Mutex::new(CancellationToken::new()),
            signals,
            shutdown: CancellationToken::new(),
            liveness: LivenessMonitor::default(),
            config,
        });

        runtime.spawn(pump(Arc::downgrade(&inner), signal_rx, inner.shutdown.clone()));
        debug!("Session built");
        Ok(Session { inner })
    }

    /// Build the session and open its transport
    pub async fn start(self) -> PeerLinkResult<Session> {
        let session = self.build()?;
        session.start().await?;
        Ok(session)
    }
}

async fn pump(inner: Weak<SessionInner>, mut signals: mpsc::UnboundedReceiver<Signal>, shutdown: CancellationToken) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Session { inner }.handle_signal(signal).await;
    }
    debug!("Session signal pump stopped");
}

/// A peer-to-peer video session
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity())
            .field("call", &self.call_status())
            .finish()
    }
}

impl Session {
    /// Start building a session
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to session events
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        self.inner.events.emit(event);
    }

    pub(crate) fn signal(&self, signal: Signal) {
        if self.inner.signals.send(signal).is_err() {
            debug!("Signal dropped, session is shutting down");
        }
    }

    /// Identity assigned by the transport
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.inner.identity.lock().clone()
    }

    // ========================================================================
    // Call lifecycle
    // ========================================================================

    /// Current call status
    pub fn call_status(&self) -> CallStatus {
        self.inner.call.lock().machine.status()
    }

    /// Snapshot of the current call
    pub fn call_session(&self) -> CallSession {
        self.inner.call.lock().machine.session().clone()
    }

    /// Remote media stream of the current call
    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.call.lock().remote_stream.clone()
    }

    /// Call the connected peer.
    ///
    /// Acquires the camera if nothing is published yet. Returns once the call
    /// has been placed; `Connected` is reported through the event stream.
    pub async fn start_call(&self) -> PeerLinkResult<()> {
        if !self.inner.transport.is_open() || self.identity().is_none() {
            return Err(PeerLinkError::NoTransport);
        }
        let remote = self.connected_peer().ok_or(PeerLinkError::NoRemote)?;

        let epoch = self.dispatch(CallInput::Dial { remote: remote.clone() }).await?;
        info!("📞 Calling {}", remote);

        let stream = match self.ensure_output().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.abort_setup(epoch, e).await),
        };
        if !self.inner.call.lock().is_live(epoch) {
            self.release_if_idle().await;
            return Err(PeerLinkError::Cancelled {
                operation: "start call".to_string(),
            });
        }

        match self.inner.transport.call(&remote, &stream).await {
            Ok(handle) => self.attach_call(epoch, handle).await,
            Err(e) => {
                let _ = self
                    .dispatch(CallInput::Abort {
                        epoch,
                        error: e.clone(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// End the call from any state.
    ///
    /// In-flight media work is cancelled first, then every teardown step runs
    /// regardless of earlier failures.
    pub async fn end_call(&self) {
        info!("📴 Ending call");
        self.cancel_pipeline();
        if let Err(e) = self.dispatch(CallInput::Hangup).await {
            warn!("Hangup failed: {}", e);
        }
    }

    async fn abort_setup(&self, epoch: u64, e: PeerLinkError) -> PeerLinkError {
        let error = match e {
            e @ (PeerLinkError::PermissionDenied { .. } | PeerLinkError::Cancelled { .. }) => e,
            other => PeerLinkError::NoLocalStream {
                reason: other.to_string(),
            },
        };
        let _ = self
            .dispatch(CallInput::Abort {
                epoch,
                error: error.clone(),
            })
            .await;
        error
    }

    async fn dispatch(&self, input: CallInput) -> PeerLinkResult<u64> {
        let (effects, epoch) = {
            let mut call = self.inner.call.lock();
            let effects = call.machine.dispatch(input)?;
            (effects, call.machine.epoch())
        };

        let mut next = self.run_effects(effects).await;
        while let Some(input) = next.take() {
            let effects = self.inner.call.lock().machine.dispatch(input)?;
            next = self.run_effects(effects).await;
        }
        Ok(epoch)
    }

    /// Run effects in order. Returns the input a finished teardown feeds back.
    async fn run_effects(&self, effects: Vec<CallEffect>) -> Option<CallInput> {
        if effects.contains(&CallEffect::ReleaseTracks) {
            self.cancel_pipeline();
        }

        let mut follow_up = None;
        for effect in effects {
            match effect {
                CallEffect::ArmWatchdog { epoch, timeout } => self.arm_watchdog(epoch, timeout),
                CallEffect::DisarmWatchdog => self.inner.call.lock().disarm_watchdog(),
                CallEffect::StopScreenShare => {
                    let mut media = self.inner.media.lock().await;
                    if media.share.disarm() {
                        self.emit(Event::KeepAliveDisarmed);
                    }
                    if media.share.finish().is_some() {
                        self.emit(Event::ScreenShareStopped);
                    }
                }
                CallEffect::CloseCall => {
                    let handle = self.inner.call.lock().handle.take();
                    if let Some(handle) = handle {
                        debug!("Closing call {}", handle.id());
                        handle.close().await;
                    }
                }
                CallEffect::ReleaseTracks => {
                    self.inner.call.lock().remote_stream = None;
                    self.release_media().await;
                    self.renew_pipeline();
                }
                CallEffect::Notify(notice) => self.notify(notice),
                CallEffect::FinishTeardown { epoch } => {
                    follow_up = Some(CallInput::TeardownDone { epoch });
                }
            }
        }
        follow_up
    }

    fn notify(&self, notice: CallNotice) {
        match notice {
            CallNotice::Status(status) => {
                info!("📞 Call {}", status);
                self.emit(Event::CallStatusChanged { status });
            }
            CallNotice::Ended { reason } => {
                info!("📴 Call ended: {}", reason);
                self.emit(Event::CallEnded { reason });
            }
            CallNotice::Failed(error) => {
                let recoverable = error.is_recoverable();
                if recoverable {
                    warn!("Call failed: {}", error);
                } else {
                    error!("Call failed: {}", error);
                }
                self.emit(Event::CallFailed { error, recoverable });
            }
        }
    }

    fn arm_watchdog(&self, epoch: u64, timeout: Duration) {
        let token = self.inner.shutdown.child_token();
        self.inner.call.lock().replace_watchdog(token.clone());
        let signals = self.inner.signals.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!("Call watchdog fired after {:?}", timeout);
                    let _ = signals.send(Signal::Watchdog { epoch });
                }
            }
        });
    }

    async fn attach_call(&self, epoch: u64, handle: Arc<dyn CallHandle>) -> PeerLinkResult<()> {
        let events = handle.take_events();
        let registered = {
            let mut call = self.inner.call.lock();
            if call.is_live(epoch) {
                call.handle = Some(handle.clone());
                true
            } else {
                false
            }
        };
        if !registered {
            debug!("Call {} belongs to a finished attempt, closing it", handle.id());
            handle.close().await;
            return Err(PeerLinkError::Cancelled {
                operation: "call setup".to_string(),
            });
        }

        if let Some(mut events) = events {
            let signals = self.inner.signals.clone();
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => {
                                if signals.send(Signal::Call { epoch, event }).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
        Ok(())
    }

    async fn accept_call(&self, handle: Arc<dyn CallHandle>) {
        let remote = handle.peer().clone();
        let epoch = match self.dispatch(CallInput::Ring { remote: remote.clone() }).await {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("Rejecting call from {}: {}", remote, e);
                handle.close().await;
                return;
            }
        };
        info!("📞 Incoming call from {}", remote);

        let stream = match self.ensure_output().await {
            Ok(stream) => stream,
            Err(e) => {
                self.abort_setup(epoch, e).await;
                handle.close().await;
                return;
            }
        };
        if !self.inner.call.lock().is_live(epoch) {
            handle.close().await;
            self.release_if_idle().await;
            return;
        }

        if let Err(e) = handle.answer(&stream).await {
            let _ = self.dispatch(CallInput::Abort { epoch, error: e }).await;
            handle.close().await;
            return;
        }
        if let Err(e) = self.attach_call(epoch, handle).await {
            debug!("Answered call was abandoned: {}", e);
        }
    }

    async fn handle_call_event(&self, epoch: u64, event: CallEvent) {
        let input = match event {
            CallEvent::Stream(stream) => {
                {
                    let mut call = self.inner.call.lock();
                    if !call.is_live(epoch) {
                        return;
                    }
                    call.remote_stream = Some(stream.clone());
                }
                info!("📺 Remote stream {} received", stream.id());
                self.emit(Event::RemoteStreamReceived { stream });
                CallInput::RemoteStream { epoch }
            }
            CallEvent::Close => CallInput::RemoteClosed { epoch },
            CallEvent::Error { kind, message } => CallInput::RemoteError { epoch, kind, message },
        };
        if let Err(e) = self.dispatch(input).await {
            warn!("Call event rejected: {}", e);
        }
    }

    // ========================================================================
    // Local media
    // ========================================================================

    fn pipeline_token(&self) -> CancellationToken {
        self.inner.pipeline_cancel.lock().clone()
    }

    fn cancel_pipeline(&self) {
        self.inner.pipeline_cancel.lock().cancel();
    }

    fn renew_pipeline(&self) {
        let mut token = self.inner.pipeline_cancel.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    async fn release_media(&self) {
        let mut media = self.inner.media.lock().await;
        media.pipeline.release().await;
        media.capture.stop();
        debug!("Local media released");
    }

    async fn release_if_idle(&self) {
        if self.call_status() == CallStatus::Idle {
            self.release_media().await;
        }
    }

    /// Publishable stream, acquiring and deriving it if needed
    async fn ensure_output(&self) -> PeerLinkResult<MediaStream> {
        let cancel = self.pipeline_token();
        let mut media = self.inner.media.lock().await;
        self.output_locked(&mut media, &cancel).await
    }

    async fn output_locked(&self, media: &mut MediaState, cancel: &CancellationToken) -> PeerLinkResult<MediaStream> {
        if let Some(output) = media.pipeline.output().filter(|s| s.is_active()) {
            return Ok(output.clone());
        }

        let MediaState { capture, pipeline, .. } = media;
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PeerLinkError::Cancelled {
                    operation: "camera acquire".to_string(),
                });
            }
            raw = capture.acquire() => raw?,
        };
        let mirror = should_mirror(capture.current_device(), capture.has_multiple_cameras());
        let output = pipeline.derive(raw, mirror, cancel).await?;
        self.watch_compositor(pipeline);

        self.emit(Event::LocalStreamChanged {
            stream: output.clone(),
        });
        self.emit(Event::MirrorChanged { mirrored: mirror });
        Ok(output)
    }

    async fn publish(&self, stream: &MediaStream, media: &mut MediaState) {
        self.watch_compositor(&media.pipeline);
        self.emit(Event::LocalStreamChanged {
            stream: stream.clone(),
        });
        if media.share.is_active() {
            debug!("Sharing, camera stream {} saved for restore", stream.id());
            media.share.update_saved(stream.clone());
            return;
        }
        self.replace_outgoing(stream, &[TrackKind::Video, TrackKind::Audio]).await;
    }

    /// Forward a fatal failure of the running compositor to the signal queue
    fn watch_compositor(&self, pipeline: &StreamPipeline) {
        let Some((stream_id, mut faults)) = pipeline.compositor_faults() else {
            return;
        };
        let signals = self.inner.signals.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let error = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                fault = faults.wait_for(Option::is_some) => match fault {
                    Ok(fault) => (*fault).clone(),
                    // Disposed without failing
                    Err(_) => return,
                },
            };
            if let Some(error) = error {
                let _ = signals.send(Signal::CompositorFailed { stream_id, error });
            }
        });
    }

    async fn handle_compositor_fault(&self, stream_id: &str, error: MediaError) {
        let cancel = self.pipeline_token();
        let mut media = self.inner.media.lock().await;
        let outcome = {
            let MediaState { capture, pipeline, .. } = &mut *media;
            pipeline.handle_compositor_fault(stream_id, error, capture, &cancel).await
        };
        let Some(outcome) = outcome else {
            return;
        };
        if let Some(stream) = &outcome.output {
            self.publish(stream, &mut media).await;
        }
        drop(media);

        let reason = outcome
            .error
            .map(|e| PeerLinkError::from(e).to_string())
            .unwrap_or_default();
        error!("🎨 Background removal stopped: {}", reason);
        self.emit(Event::BackgroundRemovalChanged {
            enabled: false,
            reverted: true,
        });
        self.emit(Event::Warning {
            message: format!("Background removal stopped: {}", reason),
        });
    }

    async fn replace_outgoing(&self, stream: &MediaStream, kinds: &[TrackKind]) {
        let handle = {
            let call = self.inner.call.lock();
            if call.machine.session().is_active() {
                call.handle.clone()
            } else {
                None
            }
        };
        let Some(handle) = handle else {
            return;
        };

        for kind in kinds {
            let track = match kind {
                TrackKind::Video => stream.video_track(),
                TrackKind::Audio => stream.audio_track(),
            };
            let Some(track) = track else {
                continue;
            };
            match handle.replace_track(*kind, &track).await {
                Ok(true) => debug!("Replaced outgoing {} track with {}", kind, track.id()),
                Ok(false) => {
                    warn!("Call {} has no {} sender", handle.id(), kind);
                    self.emit(Event::Warning {
                        message: format!("No {} sender to replace", kind),
                    });
                }
                Err(e) => {
                    warn!("Replacing outgoing {} track failed: {}", kind, e);
                    self.emit(Event::Warning {
                        message: format!("Replacing {} track failed: {}", kind, e),
                    });
                }
            }
        }
    }

    /// Stream currently published, if any
    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.inner.media.lock().await.pipeline.output().cloned()
    }

    /// What the local preview should render
    pub async fn preview(&self) -> Option<PreviewView> {
        self.inner.media.lock().await.pipeline.preview()
    }

    /// Compositing resource accounting
    pub async fn resource_stats(&self) -> ResourceStats {
        self.inner.media.lock().await.pipeline.resource_stats()
    }

    /// Acquire the camera and derive the publishable stream without calling.
    pub async fn start_preview(&self) -> PeerLinkResult<MediaStream> {
        self.ensure_output().await
    }

    /// Flip the microphone. Returns whether it is now muted.
    pub async fn toggle_audio(&self) -> bool {
        let mut media = self.inner.media.lock().await;
        let muted = !media.pipeline.settings().muted;
        media.pipeline.set_muted(muted);
        media.capture.set_muted(muted);
        info!("🎤 Microphone {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    /// Flip the camera. Returns whether video is now enabled.
    pub async fn toggle_video(&self) -> bool {
        let mut media = self.inner.media.lock().await;
        let enabled = !media.pipeline.settings().video_enabled;
        media.pipeline.set_video_enabled(enabled);
        media.capture.set_video_enabled(enabled);
        info!("📷 Camera {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    /// Turn background removal on or off and republish.
    ///
    /// Ignored while another toggle or camera switch is running. On failure
    /// the previous state is restored and the error returned.
    pub async fn set_background_removal(&self, enabled: bool) -> PeerLinkResult<bool> {
        let Some(_loading) = LoadingGuard::acquire(&self.inner.loading) else {
            debug!("Background toggle ignored, another media change is in progress");
            return Ok(self.inner.media.lock().await.pipeline.settings().background_removal_enabled);
        };
        let cancel = self.pipeline_token();

        // The model loads without holding the media lock
        let load_error = if enabled {
            match self.load_model(&cancel).await {
                Ok(()) => None,
                Err(e @ MediaError::Cancelled { .. }) => return Err(e.into()),
                Err(e) => Some(e),
            }
        } else {
            None
        };

        let mut media = self.inner.media.lock().await;
        let outcome = {
            let MediaState { capture, pipeline, .. } = &mut *media;
            match load_error {
                None => pipeline.set_background_removal(enabled, capture, &cancel).await,
                Some(e) => {
                    warn!("Segmentation model unavailable: {}", e);
                    pipeline.keep_current(e, capture, &cancel).await
                }
            }
        };
        if let Some(stream) = &outcome.output {
            self.publish(stream, &mut media).await;
        }
        drop(media);

        match outcome.error {
            None => {
                info!("🎨 Background removal {}", if outcome.enabled { "on" } else { "off" });
                self.emit(Event::BackgroundRemovalChanged {
                    enabled: outcome.enabled,
                    reverted: false,
                });
                Ok(outcome.enabled)
            }
            Some(e) => {
                let error = PeerLinkError::from(e);
                if let PeerLinkError::Cancelled { .. } = error {
                    return Err(error);
                }
                self.emit(Event::BackgroundRemovalChanged {
                    enabled: outcome.enabled,
                    reverted: true,
                });
                self.emit(Event::Warning {
                    message: format!("Background removal unavailable: {}", error),
                });
                Err(error)
            }
        }
    }

    async fn load_model(&self, cancel: &CancellationToken) -> Result<(), MediaError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MediaError::Cancelled {
                operation: "segmentation model load".to_string(),
            }),
            model = self.inner.models.get() => model.map(|_| ()),
        }
    }

    /// Choose the background drawn behind the user
    pub async fn select_background(&self, key: Option<String>) {
        if let Some(key) = key.as_deref() {
            if !self.inner.library.contains(key) {
                warn!("Background {} is not loaded", key);
                self.emit(Event::Warning {
                    message: format!("Background {} is not loaded", key),
                });
            }
        }
        self.inner.media.lock().await.pipeline.select_background(key);
    }

    /// Cycle to the next camera and republish. Returns whether the outgoing
    /// video is mirrored.
    pub async fn switch_camera(&self) -> PeerLinkResult<bool> {
        let Some(_loading) = LoadingGuard::acquire(&self.inner.loading) else {
            debug!("Camera switch ignored, another media change is in progress");
            return Ok(self.inner.media.lock().await.pipeline.settings().mirror_enabled);
        };
        let cancel = self.pipeline_token();
        let mut media = self.inner.media.lock().await;

        let (outcome, mirror) = {
            let MediaState { capture, pipeline, .. } = &mut *media;
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PeerLinkError::Cancelled {
                        operation: "camera switch".to_string(),
                    });
                }
                raw = capture.switch_camera() => raw?,
            };
            let mirror = should_mirror(capture.current_device(), capture.has_multiple_cameras());
            let outcome = pipeline.switch_source(raw, mirror, capture, &cancel).await;
            (outcome, pipeline.settings().mirror_enabled)
        };
        if let Some(stream) = &outcome.output {
            self.publish(stream, &mut media).await;
        }
        drop(media);

        info!("🔄 Switched camera (mirrored: {})", mirror);
        self.emit(Event::MirrorChanged { mirrored: mirror });
        match outcome.error {
            Some(e) => Err(e.into()),
            None => Ok(mirror),
        }
    }

    // ========================================================================
    // Screen sharing
    // ========================================================================

    /// Share the screen in place of the camera
    pub async fn start_screen_share(&self) -> PeerLinkResult<()> {
        let handle = {
            let call = self.inner.call.lock();
            if call.machine.status() != CallStatus::Connected {
                return Err(PeerLinkError::NoActiveCall);
            }
            call.handle.clone().ok_or(PeerLinkError::NoActiveCall)?
        };

        let mut media = self.inner.media.lock().await;
        if media.share.is_active() {
            return Err(PeerLinkError::AlreadySharing);
        }

        let display = media
            .capture
            .devices()
            .get_display_media(&DisplayConstraints { audio: false })
            .await?;
        for track in display.audio_tracks() {
            track.stop();
        }
        let display = MediaStream::new(display.video_tracks());
        let Some(track) = display.video_track() else {
            return Err(PeerLinkError::Media {
                reason: "display capture returned no video track".to_string(),
            });
        };

        let publishing = media.pipeline.output().cloned();
        let share_id = media.share.begin(display.clone(), publishing)?;

        match handle.replace_track(TrackKind::Video, &track).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Call {} has no video sender for the screen", handle.id());
                self.emit(Event::Warning {
                    message: "No video sender to replace".to_string(),
                });
            }
            Err(e) => {
                warn!("Publishing screen failed, stopping the share: {}", e);
                if let Some(ended) = media.share.finish() {
                    debug!("Share {} rolled back", ended.share_id);
                }
                return Err(e);
            }
        }

        let signals = self.inner.signals.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = track.ended() => {
                    let _ = signals.send(Signal::ShareEnded { share_id });
                }
            }
        });

        self.emit(Event::ScreenShareStarted);
        if media.share.needs_keep_alive() {
            self.arm_keep_alive(&mut media).await;
        }
        Ok(())
    }

    /// Stop sharing and put the camera back
    pub async fn stop_screen_share(&self) {
        let mut media = self.inner.media.lock().await;
        self.restore_after_share(&mut media).await;
    }

    /// Whether a screen share is running
    pub async fn is_screen_sharing(&self) -> bool {
        self.inner.media.lock().await.share.is_active()
    }

    async fn restore_after_share(&self, media: &mut MediaState) {
        let Some(ended) = media.share.finish() else {
            return;
        };
        if media.share.disarm() {
            self.emit(Event::KeepAliveDisarmed);
        }

        let stream = match ended.saved_previous.filter(MediaStream::is_active) {
            Some(saved) => Some(saved),
            None => {
                let cancel = self.pipeline_token();
                match self.output_locked(media, &cancel).await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        warn!("Could not restore the camera after sharing: {}", e);
                        self.emit(Event::Warning {
                            message: format!("Camera not restored: {}", e),
                        });
                        None
                    }
                }
            }
        };
        if let Some(stream) = stream {
            self.replace_outgoing(&stream, &[TrackKind::Video]).await;
        }
        self.emit(Event::ScreenShareStopped);
    }

    /// Report page visibility. Hiding the page during a share arms the
    /// keep-alive worker; showing it disarms the worker.
    pub async fn set_page_visible(&self, visible: bool) {
        let mut media = self.inner.media.lock().await;
        if !media.share.set_page_visible(visible) {
            return;
        }
        debug!("Page {}", if visible { "visible" } else { "hidden" });
        if media.share.needs_keep_alive() {
            self.arm_keep_alive(&mut media).await;
        } else if media.share.disarm() {
            self.emit(Event::KeepAliveDisarmed);
        }
    }

    async fn arm_keep_alive(&self, media: &mut MediaState) {
        match media.share.arm().await {
            Ok(Some(ticks)) => {
                self.forward_ticks(ticks);
                info!("⏱️ Keep-alive armed");
                self.emit(Event::KeepAliveArmed);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Keep-alive worker unavailable: {}", e);
                self.emit(Event::Warning {
                    message: format!("Keep-alive worker unavailable: {}", e),
                });
            }
        }
    }

    fn forward_ticks(&self, ticks: ArmedTicks) {
        let ArmedTicks { mut events, stop } = ticks;
        let signals = self.inner.signals.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(WorkerEvent::KeepAlive { timestamp }) => {
                            if signals.send(Signal::KeepAliveTick { timestamp }).is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Probe the keep-alive worker and record the result
    pub async fn ping_worker(&self) -> Option<Duration> {
        let worker = self.inner.media.lock().await.share.worker()?;
        let rtt = worker.ping().await;
        self.inner.liveness.record(rtt);
        rtt
    }

    /// Keep-alive worker liveness summary
    pub fn liveness(&self) -> LivenessReport {
        self.inner.liveness.snapshot()
    }

    // ========================================================================
    // Display
    // ========================================================================

    /// Shape of the published local video
    pub async fn local_metrics(&self) -> VideoMetrics {
        let media = self.inner.media.lock().await;
        media
            .pipeline
            .output()
            .or(media.pipeline.raw())
            .map(VideoMetrics::from_stream)
            .unwrap_or_default()
    }

    /// Shape of the remote video
    pub fn remote_metrics(&self) -> VideoMetrics {
        self.remote_stream()
            .map(|s| VideoMetrics::from_stream(&s))
            .unwrap_or_default()
    }

    /// Whether a video view should cover or contain its stream
    pub async fn object_fit(&self, is_local: bool, device_portrait: bool) -> ObjectFit {
        let video = if is_local {
            self.local_metrics().await
        } else {
            self.remote_metrics()
        };
        let media = self.inner.media.lock().await;
        let settings = media.pipeline.settings();
        object_fit(&FitContext {
            video,
            device_portrait,
            is_local,
            screen_sharing: is_local && media.share.is_active(),
            background_removal: settings.background_removal_enabled,
            mirrored: settings.mirror_enabled,
        })
    }

    // ========================================================================
    // Signals
    // ========================================================================

    async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Transport(event) => self.handle_transport_event(event).await,
            Signal::Connection { generation, event } => {
                self.handle_connection_event(generation, event).await
            }
            Signal::Call { epoch, event } => self.handle_call_event(epoch, event).await,
            Signal::Watchdog { epoch } => {
                if let Err(e) = self.dispatch(CallInput::WatchdogFired { epoch }).await {
                    warn!("Watchdog input rejected: {}", e);
                }
            }
            Signal::ShareEnded { share_id } => {
                let mut media = self.inner.media.lock().await;
                let current = media.share.session();
                if current.active && current.share_id == share_id {
                    info!("🖥️ Display track ended");
                    self.restore_after_share(&mut media).await;
                }
            }
            Signal::KeepAliveTick { timestamp } => {
                if let Err(e) = self.send_message(&AppMessage::KeepAlive { timestamp }).await {
                    debug!("Keep-alive not sent: {}", e);
                }
            }
            Signal::CompositorFailed { stream_id, error } => {
                self.handle_compositor_fault(&stream_id, error).await
            }
        }
    }

    pub(crate) fn spawn_accept(&self, handle: Arc<dyn CallHandle>) {
        let session = self.clone();
        tokio::spawn(async move { session.accept_call(handle).await });
    }

    /// Tear the session down: end the call, stop the worker, close the
    /// transport and stop emitting events.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down session");
        self.end_call().await;
        self.stop_reconnect();
        self.disconnect().await;
        self.inner.media.lock().await.share.dispose().await;
        self.inner.models.dispose();
        self.inner.transport.destroy().await;
        self.inner.shutdown.cancel();
        self.inner.events.close();
    }
}
