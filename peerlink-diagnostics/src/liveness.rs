//! Keep-alive worker liveness tracking
//!
//! Records the outcome of each worker probe and summarises recent round
//! trips. A worker is reported unhealthy after a run of missed probes.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

const DEFAULT_WINDOW: usize = 20;
const DEFAULT_MISS_LIMIT: u32 = 3;

/// Summary of recent probes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LivenessReport {
    /// Round trip of the most recent answered probe
    pub last_rtt: Option<Duration>,
    /// Mean round trip over the window
    pub average_rtt: Option<Duration>,
    /// Answered probes in the window
    pub samples: usize,
    /// Probes without an answer since creation
    pub missed: u64,
    /// Unanswered probes since the last answer
    pub consecutive_missed: u32,
    /// Whether the worker is considered alive
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct LivenessState {
    rtts: VecDeque<Duration>,
    last_rtt: Option<Duration>,
    missed: u64,
    consecutive_missed: u32,
}

/// Rolling record of worker probe results
#[derive(Debug)]
pub struct LivenessMonitor {
    window: usize,
    miss_limit: u32,
    state: Mutex<LivenessState>,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MISS_LIMIT)
    }
}

impl LivenessMonitor {
    /// Monitor averaging over `window` samples, unhealthy after `miss_limit` misses in a row
    pub fn new(window: usize, miss_limit: u32) -> Self {
        Self {
            window: window.max(1),
            miss_limit: miss_limit.max(1),
            state: Mutex::new(LivenessState::default()),
        }
    }

    /// Record a probe result: the round trip, or `None` for a miss
    pub fn record(&self, rtt: Option<Duration>) {
        let mut state = self.state.lock();
        match rtt {
            Some(rtt) => {
                if state.rtts.len() == self.window {
                    state.rtts.pop_front();
                }
                state.rtts.push_back(rtt);
                state.last_rtt = Some(rtt);
                state.consecutive_missed = 0;
            }
            None => {
                state.missed += 1;
                state.consecutive_missed += 1;
                if state.consecutive_missed == self.miss_limit {
                    warn!(
                        "Keep-alive worker missed {} probes in a row",
                        state.consecutive_missed
                    );
                }
            }
        }
    }

    /// Current summary
    pub fn snapshot(&self) -> LivenessReport {
        let state = self.state.lock();
        let average_rtt = if state.rtts.is_empty() {
            None
        } else {
            let total: Duration = state.rtts.iter().sum();
            Some(total / state.rtts.len() as u32)
        };
        LivenessReport {
            last_rtt: state.last_rtt,
            average_rtt,
            samples: state.rtts.len(),
            missed: state.missed,
            consecutive_missed: state.consecutive_missed,
            healthy: state.consecutive_missed < self.miss_limit,
        }
    }

    /// Forget all samples
    pub fn reset(&self) {
        *self.state.lock() = LivenessState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_over_window() {
        let monitor = LivenessMonitor::new(2, 3);
        monitor.record(Some(Duration::from_millis(10)));
        monitor.record(Some(Duration::from_millis(20)));
        monitor.record(Some(Duration::from_millis(40)));

        let report = monitor.snapshot();
        assert_eq!(report.samples, 2);
        assert_eq!(report.average_rtt, Some(Duration::from_millis(30)));
        assert_eq!(report.last_rtt, Some(Duration::from_millis(40)));
        assert!(report.healthy);
    }

    #[test]
    fn test_consecutive_misses_mark_unhealthy() {
        let monitor = LivenessMonitor::default();
        monitor.record(None);
        monitor.record(None);
        assert!(monitor.snapshot().healthy);

        monitor.record(None);
        let report = monitor.snapshot();
        assert!(!report.healthy);
        assert_eq!(report.missed, 3);

        monitor.record(Some(Duration::from_millis(1)));
        let report = monitor.snapshot();
        assert!(report.healthy);
        assert_eq!(report.consecutive_missed, 0);
        assert_eq!(report.missed, 3);

        monitor.reset();
        assert_eq!(monitor.snapshot(), LivenessReport {
            healthy: true,
            ..Default::default()
        });
    }
}
