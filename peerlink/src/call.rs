//! Call state machine
//!
//! Every call transition goes through [`CallStateMachine::dispatch`], which
//! is pure: it updates the session record and returns the effects the
//! session must carry out, in order. Inputs that belong to a superseded call
//! carry an old epoch and are ignored.

use crate::transport::CallHandle;
use chrono::{DateTime, Utc};
use peerlink_core::{PeerIdentity, PeerLinkError, PeerLinkResult};
use peerlink_media::MediaStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Call lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call
    Idle,
    /// Dialing or answering, waiting for the remote stream
    Connecting,
    /// Remote stream received
    Connected,
    /// Tearing down
    Ending,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ending => "ending",
        };
        f.write_str(name)
    }
}

/// Who started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We dialed
    Outgoing,
    /// The remote dialed
    Incoming,
}

/// Snapshot of the current call
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    /// Lifecycle status
    pub status: CallStatus,
    /// Remote party, while a call is active
    pub remote_peer_id: Option<PeerIdentity>,
    /// Direction of the active call
    pub direction: Option<CallDirection>,
    /// Wall clock time the call was started
    pub started_at: Option<DateTime<Utc>>,
    /// Monotonic counter identifying the current call
    pub epoch: u64,
    connected_at: Option<Instant>,
}

impl CallSession {
    fn idle(epoch: u64) -> Self {
        Self {
            status: CallStatus::Idle,
            remote_peer_id: None,
            direction: None,
            started_at: None,
            epoch,
            connected_at: None,
        }
    }

    /// Seconds since the call connected, zero when not connected
    pub fn duration_seconds(&self) -> u64 {
        self.connected_at
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Whether a call is in progress
    pub fn is_active(&self) -> bool {
        matches!(self.status, CallStatus::Connecting | CallStatus::Connected)
    }
}

/// Inputs to the call state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    /// Start an outgoing call
    Dial {
        /// Who to call
        remote: PeerIdentity,
    },
    /// An incoming call arrived
    Ring {
        /// Who is calling
        remote: PeerIdentity,
    },
    /// The remote stream arrived
    RemoteStream {
        /// Call the stream belongs to
        epoch: u64,
    },
    /// The remote side closed the call
    RemoteClosed {
        /// Call that closed
        epoch: u64,
    },
    /// The transport reported a call error
    RemoteError {
        /// Call that failed
        epoch: u64,
        /// Transport error kind
        kind: String,
        /// Transport error message
        message: String,
    },
    /// The connect watchdog expired
    WatchdogFired {
        /// Call the watchdog was armed for
        epoch: u64,
    },
    /// Local setup failed
    Abort {
        /// Call being set up
        epoch: u64,
        /// What failed
        error: PeerLinkError,
    },
    /// The user hung up
    Hangup,
    /// Every teardown effect has run
    TeardownDone {
        /// Call that was torn down
        epoch: u64,
    },
}

/// Something observers should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    /// Status changed
    Status(CallStatus),
    /// Call ended normally
    Ended {
        /// Why
        reason: String,
    },
    /// Call failed
    Failed(PeerLinkError),
}

/// Work the session performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum CallEffect {
    /// Start the connect watchdog
    ArmWatchdog {
        /// Call to time out
        epoch: u64,
        /// How long to wait for `Connected`
        timeout: Duration,
    },
    /// Cancel the connect watchdog
    DisarmWatchdog,
    /// Stop any screen share without republishing the camera
    StopScreenShare,
    /// Close the transport call handle
    CloseCall,
    /// Release local and remote tracks
    ReleaseTracks,
    /// Tell observers
    Notify(CallNotice),
    /// Feed [`CallInput::TeardownDone`] back once the effects before this one have run
    FinishTeardown {
        /// Call being torn down
        epoch: u64,
    },
}

#[derive(Debug)]
enum Outcome {
    Ended(String),
    Failed(PeerLinkError),
}

/// Pure call lifecycle state machine
#[derive(Debug)]
pub struct CallStateMachine {
    session: CallSession,
    timeout: Duration,
    ending: Option<Outcome>,
}

impl CallStateMachine {
    /// New idle machine with the given connect timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            session: CallSession::idle(0),
            timeout,
            ending: None,
        }
    }

    /// Current status
    pub fn status(&self) -> CallStatus {
        self.session.status
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.session.epoch
    }

    /// Snapshot of the call record
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Apply an input and return the effects to run, in order
    pub fn dispatch(&mut self, input: CallInput) -> PeerLinkResult<Vec<CallEffect>> {
        match input {
            CallInput::Dial { remote } => self.begin(remote, CallDirection::Outgoing),
            CallInput::Ring { remote } => self.begin(remote, CallDirection::Incoming),
            CallInput::RemoteStream { epoch } => {
                if !self.is_current(epoch) || self.session.status != CallStatus::Connecting {
                    return Ok(Vec::new());
                }
                self.session.status = CallStatus::Connected;
                self.session.connected_at = Some(Instant::now());
                Ok(vec![
                    CallEffect::DisarmWatchdog,
                    CallEffect::Notify(CallNotice::Status(CallStatus::Connected)),
                ])
            }
            CallInput::RemoteClosed { epoch } => {
                if !self.is_current(epoch) || !self.session.is_active() {
                    return Ok(Vec::new());
                }
                Ok(self.teardown(Outcome::Ended("remote closed the call".to_string())))
            }
            CallInput::RemoteError {
                epoch,
                kind,
                message,
            } => {
                if !self.is_current(epoch) || !self.session.is_active() {
                    return Ok(Vec::new());
                }
                Ok(self.teardown(Outcome::Failed(PeerLinkError::Remote { kind, message })))
            }
            CallInput::WatchdogFired { epoch } => {
                if !self.is_current(epoch) || self.session.status != CallStatus::Connecting {
                    return Ok(Vec::new());
                }
                let remote = self
                    .session
                    .remote_peer_id
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default();
                Ok(self.teardown(Outcome::Failed(PeerLinkError::CallTimeout {
                    remote,
                    after: self.timeout,
                })))
            }
            CallInput::Abort { epoch, error } => {
                if !self.is_current(epoch) || !self.session.is_active() {
                    return Ok(Vec::new());
                }
                Ok(self.teardown(Outcome::Failed(error)))
            }
            CallInput::Hangup => {
                if self.session.is_active() {
                    Ok(self.teardown(Outcome::Ended("hung up".to_string())))
                } else {
                    // Still release whatever is lying around
                    Ok(vec![
                        CallEffect::DisarmWatchdog,
                        CallEffect::StopScreenShare,
                        CallEffect::CloseCall,
                        CallEffect::ReleaseTracks,
                    ])
                }
            }
            CallInput::TeardownDone { epoch } => {
                if !self.is_current(epoch) || self.session.status != CallStatus::Ending {
                    return Ok(Vec::new());
                }
                let outcome = self
                    .ending
                    .take()
                    .unwrap_or_else(|| Outcome::Ended("hung up".to_string()));
                self.session = CallSession::idle(epoch);
                Ok(vec![
                    CallEffect::Notify(CallNotice::Status(CallStatus::Idle)),
                    CallEffect::Notify(match outcome {
                        Outcome::Ended(reason) => CallNotice::Ended { reason },
                        Outcome::Failed(error) => CallNotice::Failed(error),
                    }),
                ])
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.session.epoch
    }

    fn begin(&mut self, remote: PeerIdentity, direction: CallDirection) -> PeerLinkResult<Vec<CallEffect>> {
        if self.session.status != CallStatus::Idle {
            return Err(PeerLinkError::Busy {
                status: self.session.status.to_string(),
            });
        }

        let epoch = self.session.epoch + 1;
        self.session = CallSession {
            status: CallStatus::Connecting,
            remote_peer_id: Some(remote),
            direction: Some(direction),
            started_at: Some(Utc::now()),
            epoch,
            connected_at: None,
        };

        Ok(vec![
            CallEffect::Notify(CallNotice::Status(CallStatus::Connecting)),
            CallEffect::ArmWatchdog {
                epoch,
                timeout: self.timeout,
            },
        ])
    }

    /// Enter `Ending`. The call stays busy until [`CallInput::TeardownDone`].
    fn teardown(&mut self, outcome: Outcome) -> Vec<CallEffect> {
        self.session.status = CallStatus::Ending;
        self.ending = Some(outcome);
        vec![
            CallEffect::Notify(CallNotice::Status(CallStatus::Ending)),
            CallEffect::DisarmWatchdog,
            CallEffect::StopScreenShare,
            CallEffect::CloseCall,
            CallEffect::ReleaseTracks,
            CallEffect::FinishTeardown {
                epoch: self.session.epoch,
            },
        ]
    }
}

/// Call state plus the live resources the effects act on
#[derive(Debug)]
pub(crate) struct CallController {
    pub(crate) machine: CallStateMachine,
    pub(crate) handle: Option<Arc<dyn CallHandle>>,
    pub(crate) watchdog: Option<CancellationToken>,
    pub(crate) remote_stream: Option<MediaStream>,
}

impl CallController {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            machine: CallStateMachine::new(timeout),
            handle: None,
            watchdog: None,
            remote_stream: None,
        }
    }

    /// Whether `epoch` is the call still being set up or running
    pub(crate) fn is_live(&self, epoch: u64) -> bool {
        self.machine.epoch() == epoch && self.machine.session().is_active()
    }

    pub(crate) fn replace_watchdog(&mut self, token: CancellationToken) {
        if let Some(previous) = self.watchdog.replace(token) {
            previous.cancel();
        }
    }

    pub(crate) fn disarm_watchdog(&mut self) {
        if let Some(token) = self.watchdog.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> CallStateMachine {
        CallStateMachine::new(Duration::from_secs(30))
    }

    fn dial(m: &mut CallStateMachine) -> u64 {
        m.dispatch(CallInput::Dial {
            remote: PeerIdentity::new("bob"),
        })
        .unwrap();
        m.epoch()
    }

    fn finish(m: &mut CallStateMachine) -> Vec<CallEffect> {
        let epoch = m.epoch();
        m.dispatch(CallInput::TeardownDone { epoch }).unwrap()
    }

    #[test]
    fn test_dial_arms_watchdog() {
        let mut m = machine();
        let effects = m
            .dispatch(CallInput::Dial {
                remote: PeerIdentity::new("bob"),
            })
            .unwrap();

        assert_eq!(m.status(), CallStatus::Connecting);
        assert_eq!(
            effects,
            vec![
                CallEffect::Notify(CallNotice::Status(CallStatus::Connecting)),
                CallEffect::ArmWatchdog {
                    epoch: 1,
                    timeout: Duration::from_secs(30)
                },
            ]
        );
        assert!(m.session().started_at.is_some());
    }

    #[test]
    fn test_second_dial_is_busy() {
        let mut m = machine();
        dial(&mut m);
        let result = m.dispatch(CallInput::Ring {
            remote: PeerIdentity::new("carol"),
        });
        assert!(matches!(result, Err(PeerLinkError::Busy { .. })));
        assert_eq!(m.session().remote_peer_id, Some(PeerIdentity::new("bob")));
    }

    #[test]
    fn test_remote_stream_connects() {
        let mut m = machine();
        let epoch = dial(&mut m);
        let effects = m.dispatch(CallInput::RemoteStream { epoch }).unwrap();
        assert_eq!(m.status(), CallStatus::Connected);
        assert_eq!(effects[0], CallEffect::DisarmWatchdog);

        // A second stream for the same call changes nothing
        assert!(m.dispatch(CallInput::RemoteStream { epoch }).unwrap().is_empty());
    }

    #[test]
    fn test_teardown_order() {
        let mut m = machine();
        let epoch = dial(&mut m);
        let effects = m.dispatch(CallInput::Hangup).unwrap();
        assert_eq!(
            effects,
            vec![
                CallEffect::Notify(CallNotice::Status(CallStatus::Ending)),
                CallEffect::DisarmWatchdog,
                CallEffect::StopScreenShare,
                CallEffect::CloseCall,
                CallEffect::ReleaseTracks,
                CallEffect::FinishTeardown { epoch },
            ]
        );
        assert_eq!(m.status(), CallStatus::Ending);

        assert_eq!(
            finish(&mut m),
            vec![
                CallEffect::Notify(CallNotice::Status(CallStatus::Idle)),
                CallEffect::Notify(CallNotice::Ended {
                    reason: "hung up".to_string()
                }),
            ]
        );
        assert_eq!(m.status(), CallStatus::Idle);
        assert_eq!(m.session().remote_peer_id, None);
    }

    #[test]
    fn test_dial_while_ending_is_busy() {
        let mut m = machine();
        dial(&mut m);
        m.dispatch(CallInput::Hangup).unwrap();

        let result = m.dispatch(CallInput::Dial {
            remote: PeerIdentity::new("carol"),
        });
        assert!(matches!(result, Err(PeerLinkError::Busy { ref status }) if status == "ending"));

        finish(&mut m);
        assert!(m
            .dispatch(CallInput::Dial {
                remote: PeerIdentity::new("carol"),
            })
            .is_ok());
    }

    #[test]
    fn test_teardown_done_only_once() {
        let mut m = machine();
        let epoch = dial(&mut m);
        m.dispatch(CallInput::Hangup).unwrap();
        assert_eq!(finish(&mut m).len(), 2);
        assert!(m.dispatch(CallInput::TeardownDone { epoch }).unwrap().is_empty());
    }

    #[test]
    fn test_watchdog_times_out_connecting_call() {
        let mut m = machine();
        let epoch = dial(&mut m);
        m.dispatch(CallInput::WatchdogFired { epoch }).unwrap();
        assert_eq!(m.status(), CallStatus::Ending);
        let effects = finish(&mut m);
        assert!(effects.contains(&CallEffect::Notify(CallNotice::Failed(
            PeerLinkError::CallTimeout {
                remote: "bob".to_string(),
                after: Duration::from_secs(30),
            }
        ))));
        assert_eq!(m.status(), CallStatus::Idle);
    }

    #[test]
    fn test_stale_inputs_ignored() {
        let mut m = machine();
        let first = dial(&mut m);
        m.dispatch(CallInput::Hangup).unwrap();
        finish(&mut m);
        let second = dial(&mut m);
        assert_ne!(first, second);

        assert!(m.dispatch(CallInput::WatchdogFired { epoch: first }).unwrap().is_empty());
        assert!(m.dispatch(CallInput::RemoteStream { epoch: first }).unwrap().is_empty());
        assert!(m.dispatch(CallInput::RemoteClosed { epoch: first }).unwrap().is_empty());
        assert_eq!(m.status(), CallStatus::Connecting);
    }

    #[test]
    fn test_hangup_when_idle_still_releases() {
        let mut m = machine();
        let effects = m.dispatch(CallInput::Hangup).unwrap();
        assert!(effects.contains(&CallEffect::ReleaseTracks));
        assert!(!effects.iter().any(|e| matches!(e, CallEffect::Notify(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_counts_from_connected() {
        let mut m = machine();
        let epoch = dial(&mut m);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(m.session().duration_seconds(), 0);

        m.dispatch(CallInput::RemoteStream { epoch }).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(m.session().duration_seconds(), 3);
    }
}
