//! # PeerLink Core
//!
//! Foundational types shared by every PeerLink crate: the error taxonomy,
//! peer identities, the data-connection seam exposed by the session
//! transport, the application messages carried over it and the reconnect
//! backoff policy.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod reconnect;

// Re-export main types
pub use connection::{ConnectionEvent, DataConnection};
pub use error::{ErrorClass, PeerLinkError, PeerLinkResult};
pub use identity::PeerIdentity;
pub use protocol::AppMessage;
pub use reconnect::ReconnectPolicy;

/// Milliseconds since the unix epoch, as used in wire timestamps
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
