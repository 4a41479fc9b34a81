use std::fmt;

use serde::{Deserialize, Serialize};

/// Key under which the session is persisted (one session per deployed process).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network address of a chat, e.g. `919876543210@c.us`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChatAddress(pub String);

impl ChatAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral pairing credential emitted by the bridge, rendered as a QR code for scanning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingCode(pub String);

impl PairingCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque authentication state produced by the messaging client.
///
/// The relay never looks inside; it only hands it to the session store and back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionBlob(pub serde_json::Value);
