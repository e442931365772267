//! Session ids and the packets exchanged between a socket and its client.
//!
//! The byte encoding of packets belongs to each transport's wire layer;
//! this module only defines the logical frames the state machine routes.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Length of a generated session id.
const SID_LEN: usize = 20;

/// Payload of the ping/pong pair a client sends on a candidate transport
/// before asking for the upgrade.
pub const PROBE: &str = "probe";

/// Opaque session identifier, stable across transport upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(String);

impl Sid {
    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SID_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Sid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Sid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Handshake data carried by the `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: Sid,
    /// Transport names the client may upgrade to.
    pub upgrades: Vec<String>,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits past the interval before giving up.
    pub ping_timeout: u64,
}

/// A logical frame on a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(String),
    Upgrade,
    Noop,
}

impl Packet {
    pub fn message(data: impl Into<String>) -> Self {
        Packet::Message(data.into())
    }

    /// Returns true for the `ping probe` a client sends on a candidate transport.
    pub fn is_probe(&self) -> bool {
        matches!(self, Packet::Ping(Some(data)) if data == PROBE)
    }
}

#[cfg(test)]
#[path = "tests/packet_tests.rs"]
mod tests;
