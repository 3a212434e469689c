//! Media pipeline error types and handling
//!
//! This module defines the errors raised by capture, transforms, the
//! segmentation seam and the compositor, and how they map onto the session
//! level [`PeerLinkError`].

use peerlink_core::PeerLinkError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for media pipeline operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Invalid frame data error
    #[error("Invalid frame data: expected {expected} bytes, got {actual}")]
    InvalidFrameData {
        /// Expected data size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// Device enumeration failed
    #[error("Device enumeration failed: {reason}")]
    DeviceEnumerationFailed {
        /// Failure reason
        reason: String,
    },

    /// Device not found error
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// Device identifier
        device_id: String,
    },

    /// Permission denied error
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// Capture not active error
    #[error("Capture not active")]
    CaptureNotActive,

    /// Timeout error
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Operation aborted by teardown
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Segmentation model could not be loaded
    #[error("Model load failed: {reason}")]
    ModelLoadFailed {
        /// Failure reason
        reason: String,
    },

    /// Waiting on another caller's model load took too long
    #[error("Model load timed out after {attempts} attempts")]
    ModelLoadTimeout {
        /// Number of polling attempts
        attempts: u32,
    },

    /// Segmentation of a single frame failed
    #[error("Segmentation failed: {reason}")]
    SegmentationFailed {
        /// Failure reason
        reason: String,
    },

    /// Compositing surface could not be used
    #[error("Surface failure: {reason}")]
    SurfaceFailure {
        /// Failure reason
        reason: String,
    },

    /// Background image could not be decoded
    #[error("Failed to load image {path}: {reason}")]
    ImageLoad {
        /// Image path
        path: String,
        /// Failure reason
        reason: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MediaError::Timeout { .. } => true,
            MediaError::SegmentationFailed { .. } => true,
            MediaError::ModelLoadTimeout { .. } => true,
            MediaError::ImageLoad { .. } => true,
            MediaError::Cancelled { .. } => true,
            MediaError::PermissionDenied { .. } => false,
            MediaError::DeviceNotFound { .. } => false,
            MediaError::SurfaceFailure { .. } => false,
            _ => false,
        }
    }

    /// Single-frame failures that the render loop skips over
    pub fn is_transient(&self) -> bool {
        matches!(self, MediaError::SegmentationFailed { .. })
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            MediaError::InvalidFrameData { .. } => ErrorCategory::Data,
            MediaError::DeviceEnumerationFailed { .. } => ErrorCategory::Device,
            MediaError::DeviceNotFound { .. } => ErrorCategory::Device,
            MediaError::PermissionDenied { .. } => ErrorCategory::Permission,
            MediaError::CaptureNotActive => ErrorCategory::State,
            MediaError::Timeout { .. } => ErrorCategory::System,
            MediaError::Cancelled { .. } => ErrorCategory::State,
            MediaError::ModelLoadFailed { .. } => ErrorCategory::Model,
            MediaError::ModelLoadTimeout { .. } => ErrorCategory::Model,
            MediaError::SegmentationFailed { .. } => ErrorCategory::Model,
            MediaError::SurfaceFailure { .. } => ErrorCategory::Surface,
            MediaError::ImageLoad { .. } => ErrorCategory::Data,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// System-level errors (timeouts)
    System,
    /// Configuration and parameter errors
    Configuration,
    /// Data validation errors
    Data,
    /// Device and hardware errors
    Device,
    /// Access denied by the user or platform
    Permission,
    /// State management errors
    State,
    /// Segmentation model errors
    Model,
    /// Compositing surface errors
    Surface,
}

impl From<MediaError> for PeerLinkError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied { operation } => PeerLinkError::PermissionDenied { operation },
            MediaError::DeviceNotFound { device_id } => PeerLinkError::DeviceNotFound { device_id },
            MediaError::ModelLoadFailed { reason } => PeerLinkError::ModelLoad { reason },
            MediaError::ModelLoadTimeout { attempts } => PeerLinkError::ModelLoadTimeout { attempts },
            MediaError::SegmentationFailed { reason } => PeerLinkError::SegmentationFrame { reason },
            MediaError::SurfaceFailure { reason } => PeerLinkError::SurfaceFailure { reason },
            MediaError::Cancelled { operation } => PeerLinkError::Cancelled { operation },
            MediaError::InvalidConfiguration { message } => PeerLinkError::InvalidConfiguration {
                field: "media".to_string(),
                reason: message,
            },
            other => PeerLinkError::Media {
                reason: other.to_string(),
            },
        }
    }
}
