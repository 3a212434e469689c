//! Screen-share bookkeeping and keep-alive arming
//!
//! The manager remembers what was published before a share started so the
//! restore routine can put it back, and owns the keep-alive worker that runs
//! while a share is active with the page hidden.

use parking_lot::Mutex;
use peerlink_core::{PeerLinkError, PeerLinkResult};
use peerlink_keepalive::{KeepAliveConfig, KeepAliveHandle, WorkerEvent, WorkerResult};
use peerlink_media::MediaStream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State of the current screen share
#[derive(Debug, Clone, Default)]
pub struct ScreenShareSession {
    /// Whether a share is running
    pub active: bool,
    /// Display capture being published
    pub captured: Option<MediaStream>,
    /// Stream that was published before the share started
    pub saved_previous: Option<MediaStream>,
    /// Identifies the share so stale track-ended notifications can be dropped
    pub share_id: u64,
}

/// Ticks forwarded from an armed worker
#[derive(Debug)]
pub struct ArmedTicks {
    /// Worker events
    pub events: broadcast::Receiver<WorkerEvent>,
    /// Cancelled when the worker is disarmed
    pub stop: CancellationToken,
}

/// Owner of the share session and the keep-alive worker
#[derive(Debug)]
pub struct ScreenShareManager {
    config: KeepAliveConfig,
    session: ScreenShareSession,
    next_share: u64,
    page_visible: bool,
    worker: Option<Arc<KeepAliveHandle>>,
    ticks: Mutex<Option<CancellationToken>>,
}

impl ScreenShareManager {
    /// Idle manager. The worker is spawned on first arming.
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            session: ScreenShareSession::default(),
            next_share: 0,
            page_visible: true,
            worker: None,
            ticks: Mutex::new(None),
        }
    }

    /// Current share
    pub fn session(&self) -> &ScreenShareSession {
        &self.session
    }

    /// Whether a share is running
    pub fn is_active(&self) -> bool {
        self.session.active
    }

    /// Record a new share of `captured`, remembering `publishing` for the restore
    pub fn begin(&mut self, captured: MediaStream, publishing: Option<MediaStream>) -> PeerLinkResult<u64> {
        if self.session.active {
            return Err(PeerLinkError::AlreadySharing);
        }
        self.next_share += 1;
        self.session = ScreenShareSession {
            active: true,
            captured: Some(captured),
            saved_previous: publishing,
            share_id: self.next_share,
        };
        info!("🖥️ Screen share {} started", self.next_share);
        Ok(self.next_share)
    }

    /// Replace the stream to restore when the share ends
    pub fn update_saved(&mut self, stream: MediaStream) {
        if self.session.active {
            self.session.saved_previous = Some(stream);
        }
    }

    /// End the share, stopping the display tracks.
    ///
    /// Returns the finished session, or `None` when nothing was shared.
    pub fn finish(&mut self) -> Option<ScreenShareSession> {
        if !self.session.active {
            return None;
        }
        let ended = std::mem::take(&mut self.session);
        if let Some(captured) = &ended.captured {
            captured.stop_all();
        }
        info!("🖥️ Screen share {} stopped", ended.share_id);
        Some(ended)
    }

    /// Whether the page is visible
    pub fn page_visible(&self) -> bool {
        self.page_visible
    }

    /// Record a visibility transition. Returns whether it changed.
    pub fn set_page_visible(&mut self, visible: bool) -> bool {
        let changed = self.page_visible != visible;
        self.page_visible = visible;
        changed
    }

    /// Whether the worker should be ticking right now
    pub fn needs_keep_alive(&self) -> bool {
        self.session.active && !self.page_visible
    }

    /// Whether the worker is ticking
    pub fn is_armed(&self) -> bool {
        self.ticks.lock().is_some()
    }

    /// Start the worker ticking, spawning it if needed.
    ///
    /// Returns `None` if it was already armed.
    pub async fn arm(&mut self) -> WorkerResult<Option<ArmedTicks>> {
        if self.is_armed() {
            return Ok(None);
        }

        let worker = match &self.worker {
            Some(worker) if worker.is_running() => worker.clone(),
            _ => {
                let worker = Arc::new(KeepAliveHandle::spawn(self.config.clone()).await?);
                self.worker = Some(worker.clone());
                worker
            }
        };

        let events = worker.subscribe();
        worker.start_keep_alive()?;

        let stop = CancellationToken::new();
        *self.ticks.lock() = Some(stop.clone());
        debug!("Keep-alive armed every {}ms", self.config.interval_ms);
        Ok(Some(ArmedTicks { events, stop }))
    }

    /// Stop the worker ticking. Returns whether it was armed.
    pub fn disarm(&self) -> bool {
        let Some(stop) = self.ticks.lock().take() else {
            return false;
        };
        stop.cancel();
        if let Some(worker) = &self.worker {
            if let Err(e) = worker.stop_keep_alive() {
                warn!("Failed to stop keep-alive worker: {}", e);
            }
        }
        debug!("Keep-alive disarmed");
        true
    }

    /// The worker, once spawned
    pub fn worker(&self) -> Option<Arc<KeepAliveHandle>> {
        self.worker.clone()
    }

    /// Stop any share and terminate the worker
    pub async fn dispose(&mut self) {
        self.finish();
        self.disarm();
        if let Some(worker) = self.worker.take() {
            worker.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_media::{MediaTrack, TrackSettings};
    use std::time::Duration;

    fn display() -> MediaStream {
        MediaStream::new(vec![MediaTrack::video("screen", TrackSettings::default())])
    }

    #[test]
    fn test_begin_and_finish() {
        let mut manager = ScreenShareManager::new(KeepAliveConfig::default());
        let camera = MediaStream::new(vec![MediaTrack::video("camera", TrackSettings::default())]);
        let screen = display();

        let id = manager.begin(screen.clone(), Some(camera.clone())).unwrap();
        assert_eq!(id, 1);
        assert!(matches!(
            manager.begin(display(), None),
            Err(PeerLinkError::AlreadySharing)
        ));

        let ended = manager.finish().unwrap();
        assert!(ended.saved_previous.unwrap().same_tracks(&camera));
        assert!(!screen.is_active());
        assert!(camera.is_active());
        assert!(manager.finish().is_none());

        assert_eq!(manager.begin(display(), None).unwrap(), 2);
    }

    #[test]
    fn test_update_saved_only_while_sharing() {
        let mut manager = ScreenShareManager::new(KeepAliveConfig::default());
        let replacement = display();
        manager.update_saved(replacement.clone());
        assert!(manager.session().saved_previous.is_none());

        manager.begin(display(), None).unwrap();
        manager.update_saved(replacement.clone());
        let saved = manager.session().saved_previous.clone().unwrap();
        assert!(saved.same_tracks(&replacement));
    }

    #[test]
    fn test_keep_alive_needed_only_when_hidden_and_sharing() {
        let mut manager = ScreenShareManager::new(KeepAliveConfig::default());
        assert!(manager.set_page_visible(false));
        assert!(!manager.set_page_visible(false));
        assert!(!manager.needs_keep_alive());

        manager.begin(display(), None).unwrap();
        assert!(manager.needs_keep_alive());
        manager.set_page_visible(true);
        assert!(!manager.needs_keep_alive());
    }

    #[tokio::test]
    async fn test_arm_and_disarm_worker() {
        let mut manager = ScreenShareManager::new(KeepAliveConfig {
            interval_ms: 20,
            ..Default::default()
        });

        let mut armed = manager.arm().await.unwrap().unwrap();
        assert!(manager.is_armed());
        assert!(manager.arm().await.unwrap().is_none());

        let tick = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(WorkerEvent::KeepAlive { .. }) = armed.events.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(tick.is_ok());

        assert!(manager.disarm());
        assert!(armed.stop.is_cancelled());
        assert!(!manager.disarm());
        assert!(manager.worker().unwrap().is_running());

        manager.dispose().await;
        assert!(manager.worker().is_none());
    }
}
