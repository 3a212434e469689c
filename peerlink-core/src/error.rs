//! Error types for PeerLink
//!
//! Every error belongs to one [`ErrorClass`], which decides how the session
//! reacts to it: precondition failures abort the operation, negotiation
//! failures reset the call to idle, resource failures fall back to the last
//! known good stream and transient failures are logged and skipped.

use std::time::Duration;
use thiserror::Error;

/// Result type alias used across the PeerLink crates
pub type PeerLinkResult<T> = Result<T, PeerLinkError>;

/// Main error type for PeerLink operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerLinkError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration {
        /// Offending configuration field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The session transport has not been opened
    #[error("Session transport is not ready")]
    NoTransport,

    /// No remote peer has been selected
    #[error("No remote peer is connected")]
    NoRemote,

    /// No publishable local stream could be produced
    #[error("No local stream available: {reason}")]
    NoLocalStream {
        /// Why the stream could not be produced
        reason: String,
    },

    /// Operation requires an active call
    #[error("No active call")]
    NoActiveCall,

    /// No open data connection to send on
    #[error("No open data connection")]
    NoConnection,

    /// A screen share is already running
    #[error("Screen sharing is already active")]
    AlreadySharing,

    /// A call is already in progress
    #[error("Call already in progress (status: {status})")]
    Busy {
        /// Status of the call that blocked the request
        status: String,
    },

    /// Negotiation did not complete in time
    #[error("Call to {remote} timed out after {after:?}")]
    CallTimeout {
        /// Remote peer that never answered
        remote: String,
        /// Watchdog duration
        after: Duration,
    },

    /// Error reported by the remote side or the transport
    #[error("Remote error ({kind}): {message}")]
    Remote {
        /// Transport specific error kind
        kind: String,
        /// Human readable message
        message: String,
    },

    /// Transport reconnect attempts exhausted
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// User or platform denied access to a device
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// Requested capture device does not exist
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// Device identifier
        device_id: String,
    },

    /// Compositing surface could not be created or was lost
    #[error("Surface failure: {reason}")]
    SurfaceFailure {
        /// Reason for the failure
        reason: String,
    },

    /// Segmentation model failed to load
    #[error("Segmentation model failed to load: {reason}")]
    ModelLoad {
        /// Reason for the failure
        reason: String,
    },

    /// Timed out waiting for an in-flight model load
    #[error("Timed out waiting for segmentation model after {attempts} attempts")]
    ModelLoadTimeout {
        /// Number of polling attempts made
        attempts: u32,
    },

    /// A single frame could not be segmented
    #[error("Segmentation failed for frame: {reason}")]
    SegmentationFrame {
        /// Reason for the failure
        reason: String,
    },

    /// Other media pipeline failure
    #[error("Media error: {reason}")]
    Media {
        /// Reason for the failure
        reason: String,
    },

    /// Keep-alive worker failure
    #[error("Keep-alive worker error: {reason}")]
    Worker {
        /// Reason for the failure
        reason: String,
    },

    /// Malformed application message
    #[error("Invalid message: {reason}")]
    InvalidMessage {
        /// Parsing error
        reason: String,
    },

    /// Operation was cancelled by a teardown
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },
}

impl PeerLinkError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            PeerLinkError::Initialization { .. } => "INITIALIZATION_FAILED",
            PeerLinkError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            PeerLinkError::NoTransport => "NO_TRANSPORT",
            PeerLinkError::NoRemote => "NO_REMOTE",
            PeerLinkError::NoLocalStream { .. } => "NO_LOCAL_STREAM",
            PeerLinkError::NoActiveCall => "NO_ACTIVE_CALL",
            PeerLinkError::NoConnection => "NO_CONNECTION",
            PeerLinkError::AlreadySharing => "ALREADY_SHARING",
            PeerLinkError::Busy { .. } => "BUSY",
            PeerLinkError::CallTimeout { .. } => "CALL_TIMEOUT",
            PeerLinkError::Remote { .. } => "REMOTE_ERROR",
            PeerLinkError::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            PeerLinkError::PermissionDenied { .. } => "PERMISSION_DENIED",
            PeerLinkError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            PeerLinkError::SurfaceFailure { .. } => "SURFACE_FAILURE",
            PeerLinkError::ModelLoad { .. } => "MODEL_LOAD_FAILED",
            PeerLinkError::ModelLoadTimeout { .. } => "MODEL_LOAD_TIMEOUT",
            PeerLinkError::SegmentationFrame { .. } => "SEGMENTATION_FRAME_FAILED",
            PeerLinkError::Media { .. } => "MEDIA_ERROR",
            PeerLinkError::Worker { .. } => "WORKER_ERROR",
            PeerLinkError::InvalidMessage { .. } => "INVALID_MESSAGE",
            PeerLinkError::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Get the error class that decides the recovery policy
    pub fn class(&self) -> ErrorClass {
        match self {
            PeerLinkError::InvalidConfiguration { .. }
            | PeerLinkError::NoTransport
            | PeerLinkError::NoRemote
            | PeerLinkError::NoLocalStream { .. }
            | PeerLinkError::NoActiveCall
            | PeerLinkError::NoConnection
            | PeerLinkError::AlreadySharing => ErrorClass::Precondition,

            PeerLinkError::Busy { .. }
            | PeerLinkError::CallTimeout { .. }
            | PeerLinkError::Remote { .. }
            | PeerLinkError::ReconnectExhausted { .. }
            | PeerLinkError::InvalidMessage { .. } => ErrorClass::Negotiation,

            PeerLinkError::Initialization { .. }
            | PeerLinkError::PermissionDenied { .. }
            | PeerLinkError::DeviceNotFound { .. }
            | PeerLinkError::SurfaceFailure { .. }
            | PeerLinkError::ModelLoad { .. }
            | PeerLinkError::ModelLoadTimeout { .. }
            | PeerLinkError::Media { .. }
            | PeerLinkError::Worker { .. } => ErrorClass::Resource,

            PeerLinkError::SegmentationFrame { .. } | PeerLinkError::Cancelled { .. } => {
                ErrorClass::Transient
            }
        }
    }

    /// Terminal failures are the only ones surfaced as unrecoverable to the user
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerLinkError::ReconnectExhausted { .. } | PeerLinkError::PermissionDenied { .. }
        )
    }

    /// Check if a local fallback or a later user retry can recover from this error
    pub fn is_recoverable(&self) -> bool {
        !self.is_terminal()
    }
}

/// Error classes for recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Missing transport, stream or remote. Reported and aborted, never retried
    Precondition,
    /// Remote error or timeout. Call state resets to idle
    Negotiation,
    /// Device, surface or model failure. Falls back to the last known good stream
    Resource,
    /// Single frame failure. Logged and skipped
    Transient,
}

impl From<serde_json::Error> for PeerLinkError {
    fn from(e: serde_json::Error) -> Self {
        PeerLinkError::InvalidMessage {
            reason: e.to_string(),
        }
    }
}
