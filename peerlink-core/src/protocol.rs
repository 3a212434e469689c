//! Application messages carried over the data connection

use crate::{PeerLinkError, PeerLinkResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages exchanged between peers on the data connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppMessage {
    /// Liveness ping sent while the page is hidden during a screen share
    #[serde(rename = "keepalive")]
    KeepAlive {
        /// Milliseconds since the unix epoch at send time
        timestamp: u64,
    },
    /// Arbitrary application payload
    Data {
        /// JSON body supplied by the application
        body: serde_json::Value,
    },
}

impl AppMessage {
    /// Encode to the wire representation
    pub fn encode(&self) -> PeerLinkResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from the wire representation
    pub fn decode(payload: &[u8]) -> PeerLinkResult<Self> {
        serde_json::from_slice(payload).map_err(PeerLinkError::from)
    }

    /// Whether this is a liveness message rather than application data
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, AppMessage::KeepAlive { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keep_alive_wire_shape() {
        let msg = AppMessage::KeepAlive { timestamp: 42 };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "keepalive", "timestamp": 42}));
    }

    #[test]
    fn test_data_message_decodes() {
        let raw = br#"{"type":"data","body":{"chat":"hi"}}"#;
        let msg = AppMessage::decode(raw).unwrap();
        assert_eq!(
            msg,
            AppMessage::Data {
                body: json!({"chat": "hi"})
            }
        );
        assert!(!msg.is_keep_alive());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = AppMessage::decode(br#"{"type":"bogus"}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
    }
}
