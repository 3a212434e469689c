//! Session events and the streams that deliver them

use crate::call::CallStatus;
use parking_lot::Mutex;
use peerlink_core::{PeerIdentity, PeerLinkError};
use peerlink_media::MediaStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport is open and an identity was assigned
    PeerOpened {
        /// Our identity
        id: PeerIdentity,
    },
    /// A data connection to a remote peer opened
    PeerConnected {
        /// The remote peer
        remote: PeerIdentity,
    },
    /// The data connection to a remote peer closed
    PeerDisconnected {
        /// The remote peer
        remote: PeerIdentity,
    },
    /// Application data arrived over the data connection
    DataReceived {
        /// Sender
        from: PeerIdentity,
        /// Decoded payload
        payload: serde_json::Value,
    },
    /// The transport lost its connection and a reconnect attempt is starting
    TransportReconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// The transport reconnected
    TransportReconnected,
    /// The transport could not be recovered
    TransportFailed {
        /// Last error
        error: PeerLinkError,
    },
    /// Call status changed
    CallStatusChanged {
        /// New status
        status: CallStatus,
    },
    /// The remote media stream arrived
    RemoteStreamReceived {
        /// Remote stream
        stream: MediaStream,
    },
    /// The call ended normally
    CallEnded {
        /// Why the call ended
        reason: String,
    },
    /// The call failed
    CallFailed {
        /// What went wrong
        error: PeerLinkError,
        /// Whether trying again may succeed
        recoverable: bool,
    },
    /// The publishable local stream changed
    LocalStreamChanged {
        /// New output stream
        stream: MediaStream,
    },
    /// The outgoing video mirror state changed
    MirrorChanged {
        /// Whether the outgoing video is mirrored
        mirrored: bool,
    },
    /// Background removal was turned on or off
    BackgroundRemovalChanged {
        /// State after the change
        enabled: bool,
        /// Whether the requested change failed and was rolled back
        reverted: bool,
    },
    /// Screen sharing started
    ScreenShareStarted,
    /// Screen sharing stopped and the camera is published again
    ScreenShareStopped,
    /// The keep-alive worker started ticking
    KeepAliveArmed,
    /// The keep-alive worker stopped ticking
    KeepAliveDisarmed,
    /// Non-fatal problem worth surfacing
    Warning {
        /// Description
        message: String,
    },
}

impl Event {
    /// Stable snake_case name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::PeerOpened { .. } => "peer_opened",
            Event::PeerConnected { .. } => "peer_connected",
            Event::PeerDisconnected { .. } => "peer_disconnected",
            Event::DataReceived { .. } => "data_received",
            Event::TransportReconnecting { .. } => "transport_reconnecting",
            Event::TransportReconnected => "transport_reconnected",
            Event::TransportFailed { .. } => "transport_failed",
            Event::CallStatusChanged { .. } => "call_status_changed",
            Event::RemoteStreamReceived { .. } => "remote_stream_received",
            Event::CallEnded { .. } => "call_ended",
            Event::CallFailed { .. } => "call_failed",
            Event::LocalStreamChanged { .. } => "local_stream_changed",
            Event::MirrorChanged { .. } => "mirror_changed",
            Event::BackgroundRemovalChanged { .. } => "background_removal_changed",
            Event::ScreenShareStarted => "screen_share_started",
            Event::ScreenShareStopped => "screen_share_stopped",
            Event::KeepAliveArmed => "keep_alive_armed",
            Event::KeepAliveDisarmed => "keep_alive_disarmed",
            Event::Warning { .. } => "warning",
        }
    }

    /// Which part of the session the event comes from. Failures of any
    /// part are grouped under [`EventCategory::Error`].
    pub fn category(&self) -> EventCategory {
        match self {
            Event::PeerOpened { .. }
            | Event::PeerConnected { .. }
            | Event::PeerDisconnected { .. }
            | Event::DataReceived { .. }
            | Event::TransportReconnecting { .. }
            | Event::TransportReconnected => EventCategory::Peer,
            Event::CallStatusChanged { .. }
            | Event::RemoteStreamReceived { .. }
            | Event::CallEnded { .. } => EventCategory::Call,
            Event::LocalStreamChanged { .. }
            | Event::MirrorChanged { .. }
            | Event::BackgroundRemovalChanged { .. }
            | Event::ScreenShareStarted
            | Event::ScreenShareStopped
            | Event::KeepAliveArmed
            | Event::KeepAliveDisarmed => EventCategory::Media,
            Event::TransportFailed { .. } | Event::CallFailed { .. } | Event::Warning { .. } => {
                EventCategory::Error
            }
        }
    }
}

/// Coarse grouping of [`Event`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Transport and data connection
    Peer,
    /// Call lifecycle
    Call,
    /// Local media, screen sharing and keep-alive
    Media,
    /// Failures and warnings
    Error,
}

/// Fan-out of events to every subscribed stream
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { receiver: rx }
    }

    pub(crate) fn emit(&self, event: Event) {
        debug!("📡 {}", event.event_type());
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber. Their streams end once drained.
    pub(crate) fn close(&self) {
        self.subscribers.lock().clear();
    }
}

/// Events of one session, in emission order
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event. `None` once the session has shut down.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Stop receiving. The session forgets this stream on its next emit.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Only yield events matching `filter`
    pub fn filtered(self, filter: EventFilter) -> FilteredEventStream {
        FilteredEventStream { stream: self, filter }
    }
}

/// Selects events for a [`FilteredEventStream`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    /// Everything
    #[default]
    All,
    /// Events in any of these categories
    Categories(Vec<EventCategory>),
    /// Events whose [`Event::event_type`] is listed
    Types(Vec<String>),
}

impl EventFilter {
    /// Every event
    pub fn all() -> Self {
        Self::All
    }

    /// Call lifecycle events only
    pub fn call_only() -> Self {
        Self::Categories(vec![EventCategory::Call])
    }

    /// Events of a single category
    pub fn only(category: EventCategory) -> Self {
        Self::Categories(vec![category])
    }

    /// Whether `event` passes
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Categories(categories) => categories.contains(&event.category()),
            Self::Types(types) => types.iter().any(|t| t == event.event_type()),
        }
    }
}

/// An [`EventStream`] that skips events its filter rejects
#[derive(Debug)]
pub struct FilteredEventStream {
    stream: EventStream,
    filter: EventFilter,
}

impl FilteredEventStream {
    /// Wait for the next matching event
    pub async fn next(&mut self) -> Option<Event> {
        while let Some(event) = self.stream.next().await {
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
        None
    }
}
