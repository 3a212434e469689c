//! # PeerLink - Peer-to-Peer Video Sessions
//!
//! PeerLink runs a one-to-one video call over a pluggable session transport
//! with a local media pipeline in front of it.
//!
//! ## Key Features
//!
//! - **Explicit Call State Machine**: `idle → connecting → connected → ending`, with a connect watchdog
//! - **Stream Pipeline**: Mirroring and segmentation-based background replacement, with fallback to the last good stream
//! - **Screen Sharing**: Swaps the outgoing video in place and restores the camera afterwards
//! - **Keep-Alive Worker**: Isolated ticker that keeps a hidden page sharing
//! - **Reconnect**: Capped exponential backoff when the transport drops
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink::{LoopbackNetwork, Session, SyntheticDevices};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = LoopbackNetwork::new();
//!
//!     let alice = Session::builder()
//!         .transport(network.transport(Some("alice")))
//!         .devices(Arc::new(SyntheticDevices::new()))
//!         .start()
//!         .await?;
//!     let _bob = Session::builder()
//!         .transport(network.transport(Some("bob")))
//!         .devices(Arc::new(SyntheticDevices::new()))
//!         .start()
//!         .await?;
//!
//!     let mut events = alice.events();
//!     alice.connect("bob").await?;
//!     alice.start_call().await?;
//!
//!     while let Some(event) = events.next().await {
//!         println!("Session event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use peerlink_core::{
    AppMessage, ConnectionEvent, DataConnection, ErrorClass, PeerIdentity, PeerLinkError,
    PeerLinkResult, ReconnectPolicy,
};

pub use peerlink_media::{
    BackgroundLibrary, CaptureConfig, CompositorConfig, FacingMode, FixedRegionModel, MediaDeviceInfo,
    MediaDevices, MediaError, MediaStream, MediaTrack, MirrorConfig, ModelSlotConfig, ObjectFit,
    PipelineConfig, PreviewView, ResourceStats, SegmentationConfig, SegmentationLoader,
    SegmentationModel, StaticLoader, SyntheticDevices, TrackKind, VideoFrame, VideoMetrics,
    BUNDLED_BACKGROUNDS, DEFAULT_BACKGROUND,
};

pub use peerlink_keepalive::{KeepAliveConfig, KeepAliveHandle, WorkerCommand, WorkerEvent};

pub use peerlink_diagnostics::{init_default_logging, init_logging, LivenessReport};

// Public API modules
pub mod call;
pub mod config;
pub mod event;
pub mod loopback;
pub mod screen_share;
pub mod session;
pub mod transport;

mod peer;

// Re-export main API types
pub use call::{
    CallDirection, CallEffect, CallInput, CallNotice, CallSession, CallStateMachine, CallStatus,
};
pub use config::{CallConfig, SessionConfig};
pub use event::{Event, EventCategory, EventFilter, EventStream, FilteredEventStream};
pub use loopback::{LoopbackCall, LoopbackConnection, LoopbackNetwork, LoopbackTransport};
pub use screen_share::{ScreenShareManager, ScreenShareSession};
pub use session::{Session, SessionBuilder};
pub use transport::{CallEvent, CallHandle, SessionTransport, TransportEvent};
