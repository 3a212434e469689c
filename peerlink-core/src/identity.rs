//! Peer identity handle

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier assigned by the session transport when it opens.
///
/// Used as the address for outgoing connects and as the caller identity on
/// incoming ones. Never changes for the lifetime of the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap an identifier handed out by a transport
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identity
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the raw identifier
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PeerIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let id = PeerIdentity::new("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");
        assert_eq!(id.to_string(), "alice");
    }

    #[test]
    fn test_generated_identities_differ() {
        assert_ne!(PeerIdentity::generate(), PeerIdentity::generate());
    }
}
