//! # PeerLink Diagnostics
//!
//! Logging initialisation and keep-alive worker liveness tracking.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod liveness;
pub mod logging;

// Re-export main types
pub use liveness::{LivenessMonitor, LivenessReport};
pub use logging::{init_default_logging, init_logging, DEFAULT_DIRECTIVE};
