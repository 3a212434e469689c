//! Configuration types and defaults

use peerlink_core::{PeerLinkError, PeerLinkResult, ReconnectPolicy};
use peerlink_keepalive::KeepAliveConfig;
use peerlink_media::{
    CaptureConfig, CompositorConfig, MirrorConfig, ModelSlotConfig, PipelineConfig,
    SegmentationConfig, DEFAULT_BACKGROUND,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Call negotiation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long a call may stay in `Connecting` before it is abandoned
    pub timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl CallConfig {
    /// Watchdog duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identity to request from the transport. A random one is assigned when unset.
    pub peer_id: Option<String>,
    /// Call watchdog
    pub call: CallConfig,
    /// Camera and microphone constraints
    pub capture: CaptureConfig,
    /// Mirror, compositor and per-frame segmentation settings
    pub pipeline: PipelineConfig,
    /// Segmentation model to load
    pub segmentation: SegmentationConfig,
    /// Waiting policy for concurrent model loads
    pub model_slot: ModelSlotConfig,
    /// Keep-alive worker used while sharing with the page hidden
    pub keep_alive: KeepAliveConfig,
    /// Transport reconnect backoff
    pub reconnect: ReconnectPolicy,
    /// Background selected when compositing starts
    pub default_background: Option<String>,
    /// Background images decoded at startup
    pub background_paths: Vec<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            call: CallConfig::default(),
            capture: CaptureConfig::default(),
            pipeline: PipelineConfig::default(),
            segmentation: SegmentationConfig::default(),
            model_slot: ModelSlotConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            reconnect: ReconnectPolicy::default(),
            default_background: Some(DEFAULT_BACKGROUND.to_string()),
            background_paths: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Smaller surfaces and slower loops for constrained devices
    pub fn low_power() -> Self {
        Self {
            capture: CaptureConfig {
                ideal_width: 640,
                ideal_height: 480,
                audio: true,
            },
            pipeline: PipelineConfig {
                mirror: MirrorConfig {
                    fps: 15,
                    ..Default::default()
                },
                compositor: CompositorConfig {
                    width: 320,
                    height: 240,
                    fps: 15,
                },
                ..Default::default()
            },
            keep_alive: KeepAliveConfig {
                interval_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> PeerLinkResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PeerLinkError::InvalidConfiguration {
                field: "session".to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> PeerLinkResult<Self> {
        let path = path.as_ref();
        let json =
            std::fs::read_to_string(path).map_err(|e| PeerLinkError::InvalidConfiguration {
                field: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_json_str(&json)
    }

    /// Validate every section
    pub fn validate(&self) -> PeerLinkResult<()> {
        if self.call.timeout_ms == 0 {
            return Err(PeerLinkError::InvalidConfiguration {
                field: "call.timeout_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.model_slot.wait_attempts == 0 || self.model_slot.wait_interval_ms == 0 {
            return Err(PeerLinkError::InvalidConfiguration {
                field: "model_slot".to_string(),
                reason: "wait attempts and interval must be greater than zero".to_string(),
            });
        }
        if self.peer_id.as_deref().is_some_and(str::is_empty) {
            return Err(PeerLinkError::InvalidConfiguration {
                field: "peer_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        self.capture.validate()?;
        self.pipeline.validate()?;
        self.keep_alive.validate()?;
        self.reconnect.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.call.timeout(), Duration::from_secs(30));
        assert_eq!(config.keep_alive.interval_ms, 500);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.pipeline.compositor.width, 640);
        assert_eq!(config.default_background.as_deref(), Some(DEFAULT_BACKGROUND));
        assert!(config.validate().is_ok());
        assert!(SessionConfig::low_power().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = SessionConfig::from_json_str(
            r#"{"peer_id": "alice", "call": {"timeout_ms": 5000}, "keep_alive": {"interval_ms": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.peer_id.as_deref(), Some("alice"));
        assert_eq!(config.call.timeout_ms, 5_000);
        assert_eq!(config.keep_alive.interval_ms, 250);
        assert_eq!(config.keep_alive.busy_work_ms, 5);
        assert_eq!(config.pipeline.mirror.fps, 30);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SessionConfig::from_json_str(r#"{"call": {"timeout_ms": 0}}"#).is_err());
        assert!(SessionConfig::from_json_str(r#"{"keep_alive": {"interval_ms": 0}}"#).is_err());
        assert!(SessionConfig::from_json_str("not json").is_err());
        assert!(SessionConfig::from_json_file("/nonexistent/peerlink.json").is_err());
    }
}
