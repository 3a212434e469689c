//! # PeerLink Keep-Alive
//!
//! Isolated keep-alive worker used while a screen share runs with the page
//! hidden. The worker produces periodic `KEEP_ALIVE` ticks from its own
//! thread and answers `PING` probes, driven by the typed messages in
//! [`protocol`].

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod protocol;
pub mod worker;

// Re-export main types
pub use error::{WorkerError, WorkerResult};
pub use protocol::{WorkerCommand, WorkerEvent};
pub use worker::{KeepAliveConfig, KeepAliveHandle};
