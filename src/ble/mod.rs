//! BLE transport layer for the Frame link
//!
//! Provides the BLE abstraction traits the session consumes, a simulated
//! network for testing, the btleplug-backed central in [`platform`] and
//! the error type shared by every layer above the link.

#[cfg(feature = "ble-central")]
pub mod platform;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("No matching device found")]
    DiscoveryFailed,

    #[error("Link error: {0}")]
    LinkError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Payload too large ({size} > {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Device didn't respond")]
    NoResponse,

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Reassembly buffer exceeded {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("Couldn't open \"{path}\" for writing: {response}")]
    OpenFailed { path: String, response: String },

    #[error("Write mismatch for bytes {start}..{end}: {response}")]
    WriteMismatch {
        start: usize,
        end: usize,
        response: String,
    },

    #[error("Error closing file: {0}")]
    CloseFailed(String),

    #[error("MTU too small to write file, or escape sequence spans the whole chunk")]
    MtuTooSmall,

    #[error("Expected \"{expected}\", got \"{received}\"")]
    UnexpectedResponse { expected: String, received: String },
}
