//! Data connection seam
//!
//! A data connection is the reliable message channel the session transport
//! opens between two peers. Implementations deliver their lifecycle through a
//! single event receiver that can be taken exactly once.

use crate::{PeerIdentity, PeerLinkResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use tokio::sync::mpsc;

/// Lifecycle and payload events of a data connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection is open and can carry data
    Open,
    /// A payload arrived from the remote peer
    Data(Bytes),
    /// The connection was closed by either side
    Close,
    /// The connection failed
    Error {
        /// Transport specific error kind
        kind: String,
        /// Human readable message
        message: String,
    },
}

/// Reliable message channel to a single remote peer
#[async_trait]
pub trait DataConnection: Send + Sync + Debug {
    /// Identity of the remote end
    fn peer(&self) -> &PeerIdentity;

    /// Whether the connection is currently open
    fn is_open(&self) -> bool;

    /// Send a payload to the remote end
    async fn send(&self, payload: Bytes) -> PeerLinkResult<()>;

    /// Take the event receiver. Returns `None` once it has been taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    /// Close the connection
    async fn close(&self);
}
