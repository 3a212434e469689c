//! Keep-alive worker protocol messages
//!
//! One closed enum per direction. Both serialize as
//! `{"type": "START_KEEP_ALIVE", "payload": {"intervalMs": 500}}` so they can
//! cross a JSON boundary unchanged.

use crate::error::{WorkerError, WorkerResult};
use serde::{Deserialize, Serialize};

/// Messages from the main context to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    /// Start ticking. Restarting while active replaces the cadence.
    StartKeepAlive {
        /// Tick period in milliseconds
        #[serde(rename = "intervalMs")]
        interval_ms: u64,
    },
    /// Stop ticking
    StopKeepAlive,
    /// Liveness probe, echoed back as `PONG`
    Ping {
        /// Opaque value echoed in the reply
        timestamp: u64,
    },
}

/// Messages from the worker to the main context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    /// Worker is up and accepting commands
    Ready,
    /// Ticking state changed
    Status {
        /// Whether ticks are being produced
        #[serde(rename = "isActive")]
        is_active: bool,
    },
    /// One keep-alive tick
    KeepAlive {
        /// Milliseconds since the unix epoch at the tick
        timestamp: u64,
    },
    /// Reply to `PING`
    Pong {
        /// Value from the matching `PING`
        timestamp: u64,
    },
}

impl WorkerCommand {
    /// Serialize to JSON
    pub fn to_json(&self) -> WorkerResult<String> {
        serde_json::to_string(self).map_err(WorkerError::from)
    }

    /// Parse from JSON. Unknown message types are an error.
    pub fn from_json(text: &str) -> WorkerResult<Self> {
        serde_json::from_str(text).map_err(WorkerError::from)
    }

    /// Message type as it appears on the wire
    pub fn message_type(&self) -> &'static str {
        match self {
            WorkerCommand::StartKeepAlive { .. } => "START_KEEP_ALIVE",
            WorkerCommand::StopKeepAlive => "STOP_KEEP_ALIVE",
            WorkerCommand::Ping { .. } => "PING",
        }
    }
}

impl WorkerEvent {
    /// Serialize to JSON
    pub fn to_json(&self) -> WorkerResult<String> {
        serde_json::to_string(self).map_err(WorkerError::from)
    }

    /// Parse from JSON. Unknown message types are an error.
    pub fn from_json(text: &str) -> WorkerResult<Self> {
        serde_json::from_str(text).map_err(WorkerError::from)
    }

    /// Message type as it appears on the wire
    pub fn message_type(&self) -> &'static str {
        match self {
            WorkerEvent::Ready => "READY",
            WorkerEvent::Status { .. } => "STATUS",
            WorkerEvent::KeepAlive { .. } => "KEEP_ALIVE",
            WorkerEvent::Pong { .. } => "PONG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let start = WorkerCommand::StartKeepAlive { interval_ms: 500 };
        let json: serde_json::Value = serde_json::from_str(&start.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "START_KEEP_ALIVE");
        assert_eq!(json["payload"]["intervalMs"], 500);

        let stop = WorkerCommand::from_json(r#"{"type":"STOP_KEEP_ALIVE"}"#).unwrap();
        assert_eq!(stop, WorkerCommand::StopKeepAlive);

        let ping = WorkerCommand::from_json(r#"{"type":"PING","payload":{"timestamp":42}}"#).unwrap();
        assert_eq!(ping, WorkerCommand::Ping { timestamp: 42 });
        assert_eq!(ping.message_type(), "PING");
    }

    #[test]
    fn test_event_wire_format() {
        let status = WorkerEvent::Status { is_active: true };
        let json: serde_json::Value = serde_json::from_str(&status.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "STATUS");
        assert_eq!(json["payload"]["isActive"], true);

        let ready = WorkerEvent::from_json(r#"{"type":"READY"}"#).unwrap();
        assert_eq!(ready, WorkerEvent::Ready);
        assert_eq!(
            WorkerEvent::KeepAlive { timestamp: 7 }.message_type(),
            "KEEP_ALIVE"
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = WorkerCommand::from_json(r#"{"type":"REBOOT"}"#);
        assert!(matches!(result, Err(WorkerError::InvalidMessage { .. })));
    }
}
