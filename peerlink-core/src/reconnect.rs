//! Capped exponential backoff for transport reconnects
//!
//! Reconnecting the session transport is one of only two automatic retries
//! (the other being the call watchdog). Everything else is one-shot.

use crate::{PeerLinkError, PeerLinkResult};
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconnect policy for the session transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt, in milliseconds
    pub min_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Randomize delays to avoid synchronized retries
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 2_000,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> PeerLinkResult<()> {
        if self.min_delay_ms == 0 {
            return Err(PeerLinkError::InvalidConfiguration {
                field: "reconnect.min_delay_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_delay_ms < self.min_delay_ms {
            return Err(PeerLinkError::InvalidConfiguration {
                field: "reconnect.max_delay_ms".to_string(),
                reason: "must not be smaller than min_delay_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Delays to wait before each attempt
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_attempts as usize);
        if self.jitter {
            builder = builder.with_jitter();
        }
        builder.build()
    }

    /// Run `attempt` until it succeeds, the attempts are exhausted or `cancel` fires.
    ///
    /// The closure receives the 1-based attempt number. Terminal errors stop
    /// the loop immediately.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> PeerLinkResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PeerLinkResult<T>>,
    {
        let mut made = 0u32;

        for delay in self.delays() {
            made += 1;
            debug!("Reconnect attempt {} in {:?}", made, delay);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PeerLinkError::Cancelled {
                        operation: "reconnect".to_string(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match attempt(made).await {
                Ok(value) => {
                    info!("Reconnected after {} attempt(s)", made);
                    return Ok(value);
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", made, e);
                }
            }
        }

        Err(PeerLinkError::ReconnectExhausted { attempts: made })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay_ms: 100,
            max_delay_ms: 2_000,
            max_attempts: 5,
            jitter: false,
        }
    }

    #[test]
    fn test_delays_are_capped() {
        let delays: Vec<Duration> = fast_policy().delays().collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy()
            .run(&CancellationToken::new(), move |n| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(PeerLinkError::Remote {
                            kind: "network".to_string(),
                            message: "down".to_string(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_after_max_attempts() {
        let result: PeerLinkResult<()> = fast_policy()
            .run(&CancellationToken::new(), |_| async {
                Err(PeerLinkError::Remote {
                    kind: "network".to_string(),
                    message: "down".to_string(),
                })
            })
            .await;

        assert_eq!(result, Err(PeerLinkError::ReconnectExhausted { attempts: 5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: PeerLinkResult<()> = fast_policy().run(&cancel, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(PeerLinkError::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: PeerLinkResult<()> = fast_policy()
            .run(&CancellationToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PeerLinkError::PermissionDenied {
                        operation: "network".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(PeerLinkError::PermissionDenied { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
