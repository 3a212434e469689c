//! Keep-alive worker and its handle
//!
//! The worker runs on a dedicated OS thread with its own single-threaded
//! runtime, so its timer keeps firing while the main runtime is starved or
//! throttled. The two sides only talk through channels: commands go in over
//! an unbounded mpsc, events come out over a broadcast channel.

use crate::error::{WorkerError, WorkerResult};
use crate::protocol::{WorkerCommand, WorkerEvent};
use parking_lot::Mutex;
use peerlink_core::unix_millis;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WORKER_THREAD_NAME: &str = "peerlink-keepalive";

/// Keep-alive worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Default tick period in milliseconds
    pub interval_ms: u64,
    /// Busy-work pulse performed on every tick, in milliseconds
    pub busy_work_ms: u64,
    /// How long `ping` waits for the matching `PONG`
    pub ping_timeout_ms: u64,
    /// How long `spawn` waits for `READY`
    pub ready_timeout_ms: u64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            busy_work_ms: 5,
            ping_timeout_ms: 1_000,
            ready_timeout_ms: 1_000,
            event_capacity: 64,
        }
    }
}

impl KeepAliveConfig {
    /// Validate configuration
    pub fn validate(&self) -> WorkerResult<()> {
        if self.interval_ms == 0 {
            return Err(WorkerError::InvalidConfiguration {
                reason: "interval_ms must be greater than zero".to_string(),
            });
        }
        if self.busy_work_ms >= self.interval_ms {
            return Err(WorkerError::InvalidConfiguration {
                reason: "busy_work_ms must be shorter than the interval".to_string(),
            });
        }
        if self.ping_timeout_ms == 0 || self.ready_timeout_ms == 0 {
            return Err(WorkerError::InvalidConfiguration {
                reason: "timeouts must be greater than zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(WorkerError::InvalidConfiguration {
                reason: "event_capacity must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

struct Worker {
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: CancellationToken,
    busy_work: Duration,
    ticker: Option<Interval>,
}

impl Worker {
    async fn run(mut self) {
        self.emit(WorkerEvent::Ready);
        debug!("Keep-alive worker ready");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = next_tick(&mut self.ticker) => self.pulse(),
            }
        }

        debug!("Keep-alive worker stopped");
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::StartKeepAlive { interval_ms } => {
                let period = Duration::from_millis(interval_ms.max(1));
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                if self.ticker.replace(ticker).is_some() {
                    debug!("Keep-alive restarted at {:?}", period);
                }
                self.emit(WorkerEvent::Status { is_active: true });
            }
            WorkerCommand::StopKeepAlive => {
                self.ticker = None;
                self.emit(WorkerEvent::Status { is_active: false });
            }
            WorkerCommand::Ping { timestamp } => {
                self.emit(WorkerEvent::Pong { timestamp });
            }
        }
    }

    fn pulse(&self) {
        // Real CPU work so the thread is not treated as idle
        let started = std::time::Instant::now();
        while started.elapsed() < self.busy_work {
            std::hint::spin_loop();
        }
        self.emit(WorkerEvent::KeepAlive {
            timestamp: unix_millis(),
        });
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle to a running keep-alive worker
pub struct KeepAliveHandle {
    config: KeepAliveConfig,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    last_probe: AtomicU64,
}

impl std::fmt::Debug for KeepAliveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveHandle")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl KeepAliveHandle {
    /// Start a worker thread and wait for its `READY`
    pub async fn spawn(config: KeepAliveConfig) -> WorkerResult<Self> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);
        let mut ready = events.subscribe();
        let shutdown = CancellationToken::new();

        let worker = Worker {
            commands: command_rx,
            events: events.clone(),
            shutdown: shutdown.clone(),
            busy_work: Duration::from_millis(config.busy_work_ms),
            ticker: None,
        };

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Keep-alive worker runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })
            .map_err(|e| WorkerError::Spawn {
                reason: e.to_string(),
            })?;

        let handle = Self {
            config,
            commands,
            events,
            shutdown,
            thread: Mutex::new(Some(thread)),
            last_probe: AtomicU64::new(0),
        };

        let after = Duration::from_millis(handle.config.ready_timeout_ms);
        let wait_ready = async {
            loop {
                match ready.recv().await {
                    Ok(WorkerEvent::Ready) => return Ok(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(WorkerError::Terminated),
                }
            }
        };
        match tokio::time::timeout(after, wait_ready).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                handle.shutdown.cancel();
                return Err(WorkerError::NotReady { after });
            }
        }

        info!("Keep-alive worker started on thread {}", WORKER_THREAD_NAME);
        Ok(handle)
    }

    /// Worker configuration
    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Send a command to the worker
    pub fn post(&self, command: WorkerCommand) -> WorkerResult<()> {
        debug!("Posting {} to keep-alive worker", command.message_type());
        self.commands
            .send(command)
            .map_err(|_| WorkerError::Terminated)
    }

    /// Send a JSON encoded command. Unparseable or unknown messages are
    /// logged and ignored; returns whether a command was posted.
    pub fn post_json(&self, text: &str) -> WorkerResult<bool> {
        match WorkerCommand::from_json(text) {
            Ok(command) => self.post(command).map(|_| true),
            Err(e) => {
                warn!("Ignoring worker message: {}", e);
                Ok(false)
            }
        }
    }

    /// Subscribe to worker events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Start ticking at the configured interval
    pub fn start_keep_alive(&self) -> WorkerResult<()> {
        self.start_keep_alive_every(self.config.interval_ms)
    }

    /// Start ticking at a custom interval
    pub fn start_keep_alive_every(&self, interval_ms: u64) -> WorkerResult<()> {
        self.post(WorkerCommand::StartKeepAlive { interval_ms })
    }

    /// Stop ticking
    pub fn stop_keep_alive(&self) -> WorkerResult<()> {
        self.post(WorkerCommand::StopKeepAlive)
    }

    /// Probe the worker. Returns the round trip, or `None` when no matching
    /// `PONG` arrives within the probe window.
    pub async fn ping(&self) -> Option<Duration> {
        let mut events = self.subscribe();
        let token = self.next_probe_token();
        let sent = Instant::now();
        self.post(WorkerCommand::Ping { timestamp: token }).ok()?;

        let wait_pong = async {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::Pong { timestamp }) if timestamp == token => return Some(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        };

        let window = Duration::from_millis(self.config.ping_timeout_ms);
        match tokio::time::timeout(window, wait_pong).await {
            Ok(Some(())) => Some(sent.elapsed()),
            _ => {
                warn!("Keep-alive worker did not answer within {:?}", window);
                None
            }
        }
    }

    fn next_probe_token(&self) -> u64 {
        let now = unix_millis();
        let mut previous = self.last_probe.load(Ordering::SeqCst);
        loop {
            let token = now.max(previous + 1);
            match self
                .last_probe
                .compare_exchange(previous, token, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return token,
                Err(current) => previous = current,
            }
        }
    }

    /// Whether the worker thread is still running
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self
                .thread
                .lock()
                .as_ref()
                .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the worker and wait for its thread to exit
    pub async fn terminate(&self) {
        self.shutdown.cancel();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => info!("Keep-alive worker terminated"),
            Ok(Err(_)) => error!("Keep-alive worker thread panicked"),
            Err(e) => warn!("Failed to join keep-alive worker: {}", e),
        }
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(KeepAliveConfig::default().validate().is_ok());

        let config = KeepAliveConfig {
            interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = KeepAliveConfig {
            interval_ms: 5,
            busy_work_ms: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_probe_tokens_are_unique() {
        let handle = KeepAliveHandle::spawn(KeepAliveConfig::default()).await.unwrap();
        let a = handle.next_probe_token();
        let b = handle.next_probe_token();
        assert!(b > a);
        handle.terminate().await;
    }
}
