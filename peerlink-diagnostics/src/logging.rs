//! Structured logging setup

use peerlink_core::{PeerLinkError, PeerLinkResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor a directive is supplied
pub const DEFAULT_DIRECTIVE: &str = "info";

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` is used. Calling
/// this again after a subscriber is installed is a no-op.
pub fn init_logging(default_directive: &str) -> PeerLinkResult<()> {
    if INSTALLED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive).map_err(|e| {
            PeerLinkError::InvalidConfiguration {
                field: "log_filter".to_string(),
                reason: e.to_string(),
            }
        })?,
    };

    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
    {
        Ok(()) => {
            INSTALLED.store(true, Ordering::SeqCst);
            tracing::debug!("Logging initialised");
            Ok(())
        }
        // Someone else installed a global subscriber first
        Err(_) => {
            INSTALLED.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}

/// Install the subscriber with [`DEFAULT_DIRECTIVE`]
pub fn init_default_logging() -> PeerLinkResult<()> {
    init_logging(DEFAULT_DIRECTIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        tokio_test::assert_ok!(init_logging("peerlink=debug"));
        tokio_test::assert_ok!(init_logging("peerlink=debug"));
        tokio_test::assert_ok!(init_default_logging());
    }
}
