//! Keep-alive worker errors

use peerlink_core::PeerLinkError;
use std::time::Duration;
use thiserror::Error;

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised by the keep-alive worker and its handle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The worker thread could not be started
    #[error("Failed to spawn keep-alive worker: {reason}")]
    Spawn {
        /// Underlying cause
        reason: String,
    },

    /// The worker did not report READY in time
    #[error("Keep-alive worker not ready after {after:?}")]
    NotReady {
        /// How long the handle waited
        after: Duration,
    },

    /// The worker has shut down
    #[error("Keep-alive worker terminated")]
    Terminated,

    /// A message could not be parsed
    #[error("Invalid worker message: {reason}")]
    InvalidMessage {
        /// Parser error
        reason: String,
    },

    /// Configuration rejected by `validate()`
    #[error("Invalid keep-alive configuration: {reason}")]
    InvalidConfiguration {
        /// What is wrong
        reason: String,
    },
}

impl WorkerError {
    /// Whether spawning a fresh worker might succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WorkerError::NotReady { .. } | WorkerError::Terminated)
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::InvalidMessage {
            reason: e.to_string(),
        }
    }
}

impl From<WorkerError> for PeerLinkError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::InvalidMessage { reason } => PeerLinkError::InvalidMessage { reason },
            WorkerError::InvalidConfiguration { reason } => PeerLinkError::InvalidConfiguration {
                field: "keep_alive".to_string(),
                reason,
            },
            other => PeerLinkError::Worker {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_into_core_error() {
        let err: PeerLinkError = WorkerError::Terminated.into();
        assert!(matches!(err, PeerLinkError::Worker { .. }));

        let err: PeerLinkError = WorkerError::InvalidMessage {
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(
            err,
            PeerLinkError::InvalidMessage {
                reason: "bad".to_string()
            }
        );
        assert!(WorkerError::Terminated.is_recoverable());
    }
}
