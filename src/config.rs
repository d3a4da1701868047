//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_REASSEMBLY_BYTES;

/// Tunables for one [`Session`](crate::session::Session).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long (in millis) a wait for a text or data reply lasts by default.
    pub response_timeout_ms: u64,
    /// How long (in millis) discovery listens for advertisements.
    pub scan_duration_ms: u64,
    /// Soft cap on one reassembled message.
    pub max_reassembly_bytes: usize,
    /// Log every transmitted frame at info level.
    pub echo_transmit: bool,
    /// MTU assumed when the BLE stack doesn't report the negotiated one.
    pub fallback_mtu: usize,
    /// Install the remote helper routines when a [`Frame`](crate::frame::Frame)
    /// connects.
    pub inject_library: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            scan_duration_ms: 3_000,
            max_reassembly_bytes: DEFAULT_MAX_REASSEMBLY_BYTES,
            echo_transmit: false,
            fallback_mtu: 247,
            inject_library: true,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }
}
