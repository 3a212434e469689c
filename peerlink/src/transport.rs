//! Session transport seam
//!
//! The session transport hands out a peer identity, opens data connections
//! and negotiates media calls. Every implementation reports asynchronous
//! activity through event receivers that are taken exactly once.

use async_trait::async_trait;
use peerlink_core::{DataConnection, PeerIdentity, PeerLinkResult};
use peerlink_media::{MediaStream, MediaTrack, TrackKind};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Asynchronous activity on the transport itself
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote peer opened a data connection to us
    IncomingConnection(Arc<dyn DataConnection>),
    /// A remote peer is calling us
    IncomingCall(Arc<dyn CallHandle>),
    /// The transport lost its signalling connection
    Disconnected,
    /// The transport failed
    Error {
        /// Transport specific error kind
        kind: String,
        /// Human readable message
        message: String,
    },
}

/// Activity on a single media call
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The remote media stream arrived
    Stream(MediaStream),
    /// The call was closed
    Close,
    /// The call failed
    Error {
        /// Transport specific error kind
        kind: String,
        /// Human readable message
        message: String,
    },
}

/// One negotiated media call
#[async_trait]
pub trait CallHandle: Send + Sync + Debug {
    /// Transport assigned call identifier
    fn id(&self) -> &str;

    /// The other party
    fn peer(&self) -> &PeerIdentity;

    /// Accept an incoming call, publishing `stream`
    async fn answer(&self, stream: &MediaStream) -> PeerLinkResult<()>;

    /// Take the event receiver. Returns `None` once it has been taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>>;

    /// Swap the outgoing track of `kind` without renegotiating.
    ///
    /// Returns `false` when the call has no sender of that kind.
    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> PeerLinkResult<bool>;

    /// Close the call
    async fn close(&self);
}

/// Signalling and negotiation provider
#[async_trait]
pub trait SessionTransport: Send + Sync + Debug {
    /// Connect to the signalling service and obtain an identity
    async fn open(&self) -> PeerLinkResult<PeerIdentity>;

    /// Identity assigned by the last successful `open`
    fn identity(&self) -> Option<PeerIdentity>;

    /// Whether the transport is connected to signalling
    fn is_open(&self) -> bool;

    /// Reconnect after a disconnect, keeping the identity
    async fn reconnect(&self) -> PeerLinkResult<()>;

    /// Open a data connection to `remote`
    async fn connect(&self, remote: &PeerIdentity) -> PeerLinkResult<Arc<dyn DataConnection>>;

    /// Call `remote`, offering `stream`
    async fn call(&self, remote: &PeerIdentity, stream: &MediaStream) -> PeerLinkResult<Arc<dyn CallHandle>>;

    /// Take the event receiver. Returns `None` once it has been taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Tear down the transport and everything it opened
    async fn destroy(&self);
}
