//! Application protocol spoken over the Frame's single write / single
//! notify characteristic pair.
//!
//! Frames going out are either raw script text or a data frame led by
//! [`DATA_TAG`]. Notifications coming back are classified by their leading
//! byte(s); see [`reassembly`].

pub mod commands;
pub mod escape;
pub mod reassembly;

use uuid::Uuid;

/// Primary Frame GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x7a230001_5475_a6a4_654c_8431f6ad49c4);

/// Host → device characteristic (write).
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x7a230002_5475_a6a4_654c_8431f6ad49c4);

/// Device → host characteristic (notify).
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x7a230003_5475_a6a4_654c_8431f6ad49c4);

/// ATT header bytes taken out of every write/notification.
pub const ATT_OVERHEAD: usize = 3;

/// Leads every data frame, in both directions.
pub const DATA_TAG: u8 = 0x01;

/// Second byte of a data notification carrying one chunk of a long payload.
pub const DATA_LONG_CHUNK: u8 = 0x01;

/// Second byte of a data notification closing a long payload; the rest is
/// the decimal chunk count.
pub const DATA_LONG_END: u8 = 0x02;

/// Leads a text notification carrying one chunk of a long print.
pub const TEXT_LONG_CHUNK: u8 = 0x0a;

/// Leads a text notification closing a long print; the rest is the
/// decimal chunk count.
pub const TEXT_LONG_END: u8 = 0x0b;

/// Interrupts whatever script is currently running.
pub const BREAK_SIGNAL: u8 = 0x03;

/// Resets the scripting VM.
pub const RESET_SIGNAL: u8 = 0x04;

/// Soft cap on a single reassembled message.
pub const DEFAULT_MAX_REASSEMBLY_BYTES: usize = 10 * 1024 * 1024;

/// The two logical channels multiplexed over notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Print output of the remote script.
    Text,
    /// Raw bytes sent by the remote script.
    Data,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Text => f.write_str("text"),
            Channel::Data => f.write_str("data"),
        }
    }
}

/// Largest script payload for a given MTU.
pub fn max_text_payload(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_OVERHEAD)
}

/// Largest raw data payload for a given MTU (one byte goes to [`DATA_TAG`]).
pub fn max_data_payload(mtu: usize) -> usize {
    max_text_payload(mtu).saturating_sub(1)
}
