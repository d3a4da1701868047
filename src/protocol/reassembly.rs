//! Notification reassembly
//!
//! Each notification is classified by its leading byte(s):
//!
//! ```text
//! 0x0a <chunk>        long text, one chunk
//! 0x0b <count>        long text done, <count> chunks were sent
//! 0x01 0x01 <chunk>   long data, one chunk
//! 0x01 0x02 <count>   long data done, <count> chunks were sent
//! 0x01 <bytes>        short data
//! <anything else>     short text
//! ```
//!
//! Text and data accumulate independently, so a long print can be in
//! flight while data arrives and vice versa. The [`Reassembler`] is plain
//! synchronous state; the session's receive task owns one per link.

use thiserror::Error;

use super::{Channel, DATA_LONG_CHUNK, DATA_LONG_END, DATA_TAG, TEXT_LONG_CHUNK, TEXT_LONG_END};
use crate::ble::BleError;

/// A completed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Data(Vec<u8>),
}

impl Message {
    pub fn channel(&self) -> Channel {
        match self {
            Message::Text(_) => Channel::Text,
            Message::Data(_) => Channel::Data,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("{channel} chunk count mismatch: device sent {declared}, received {received}")]
    ChunkCountMismatch {
        channel: Channel,
        declared: usize,
        received: usize,
    },

    #[error("{channel} chunk count is not a number: {raw:?}")]
    BadChunkCount { channel: Channel, raw: String },

    #[error("{channel} message exceeded {limit} bytes")]
    Overflow { channel: Channel, limit: usize },
}

impl ReassemblyError {
    /// The channel whose transfer was abandoned.
    pub fn channel(&self) -> Channel {
        match self {
            ReassemblyError::ChunkCountMismatch { channel, .. }
            | ReassemblyError::BadChunkCount { channel, .. }
            | ReassemblyError::Overflow { channel, .. } => *channel,
        }
    }
}

impl From<ReassemblyError> for BleError {
    fn from(err: ReassemblyError) -> Self {
        match err {
            ReassemblyError::Overflow { limit, .. } => BleError::BufferOverflow { limit },
            other => BleError::ProtocolMismatch(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
enum ChannelState {
    #[default]
    Idle,
    Accumulating { buffer: Vec<u8>, chunks: usize },
}

/// Per-link reassembly state for both channels.
#[derive(Debug)]
pub struct Reassembler {
    text: ChannelState,
    data: ChannelState,
    max_bytes: usize,
}

impl Reassembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: ChannelState::Idle,
            data: ChannelState::Idle,
            max_bytes,
        }
    }

    /// Feed one notification. Returns the completed message, if this
    /// notification completed one.
    ///
    /// An error abandons the in-progress transfer on that channel only;
    /// the channel is back to idle afterwards.
    pub fn feed(&mut self, frame: &[u8]) -> Result<Option<Message>, ReassemblyError> {
        match frame {
            [DATA_TAG, DATA_LONG_CHUNK, chunk @ ..] => {
                self.accumulate(Channel::Data, chunk)?;
                Ok(None)
            }
            [DATA_TAG, DATA_LONG_END, count @ ..] => {
                let bytes = self.finish(Channel::Data, count)?;
                Ok(Some(Message::Data(bytes)))
            }
            [DATA_TAG, payload @ ..] => Ok(Some(Message::Data(payload.to_vec()))),
            [TEXT_LONG_CHUNK, chunk @ ..] => {
                self.accumulate(Channel::Text, chunk)?;
                Ok(None)
            }
            [TEXT_LONG_END, count @ ..] => {
                let bytes = self.finish(Channel::Text, count)?;
                Ok(Some(Message::Text(String::from_utf8_lossy(&bytes).into_owned())))
            }
            _ => Ok(Some(Message::Text(String::from_utf8_lossy(frame).into_owned()))),
        }
    }

    /// Whether a long message is in progress on `channel`.
    pub fn is_accumulating(&self, channel: Channel) -> bool {
        matches!(self.state(channel), ChannelState::Accumulating { .. })
    }

    /// Discard anything in progress on both channels.
    pub fn reset(&mut self) {
        self.text = ChannelState::Idle;
        self.data = ChannelState::Idle;
    }

    fn state(&self, channel: Channel) -> &ChannelState {
        match channel {
            Channel::Text => &self.text,
            Channel::Data => &self.data,
        }
    }

    fn state_mut(&mut self, channel: Channel) -> &mut ChannelState {
        match channel {
            Channel::Text => &mut self.text,
            Channel::Data => &mut self.data,
        }
    }

    fn accumulate(&mut self, channel: Channel, chunk: &[u8]) -> Result<(), ReassemblyError> {
        let limit = self.max_bytes;
        let state = self.state_mut(channel);
        if let ChannelState::Idle = state {
            *state = ChannelState::Accumulating {
                buffer: Vec::new(),
                chunks: 0,
            };
        }
        if let ChannelState::Accumulating { buffer, chunks } = state {
            if buffer.len() + chunk.len() > limit {
                *state = ChannelState::Idle;
                return Err(ReassemblyError::Overflow { channel, limit });
            }
            buffer.extend_from_slice(chunk);
            *chunks += 1;
        }
        Ok(())
    }

    fn finish(&mut self, channel: Channel, count: &[u8]) -> Result<Vec<u8>, ReassemblyError> {
        let (buffer, received) = match std::mem::take(self.state_mut(channel)) {
            ChannelState::Idle => (Vec::new(), 0),
            ChannelState::Accumulating { buffer, chunks } => (buffer, chunks),
        };

        let raw = String::from_utf8_lossy(count);
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(buffer);
        }
        let declared: usize = raw.parse().map_err(|_| ReassemblyError::BadChunkCount {
            channel,
            raw: raw.to_string(),
        })?;
        if declared != received {
            return Err(ReassemblyError::ChunkCountMismatch {
                channel,
                declared,
                received,
            });
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &[u8], body: &[u8]) -> Vec<u8> {
        let mut frame = tag.to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_short_messages() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.feed(b"hello").unwrap(), Some(Message::Text("hello".into())));
        assert_eq!(
            r.feed(&[DATA_TAG, 0xde, 0xad]).unwrap(),
            Some(Message::Data(vec![0xde, 0xad]))
        );
        assert_eq!(r.feed(&[DATA_TAG]).unwrap(), Some(Message::Data(vec![])));
        assert_eq!(r.feed(b"").unwrap(), Some(Message::Text(String::new())));
    }

    #[test]
    fn test_long_text() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.feed(&tagged(&[TEXT_LONG_CHUNK], b"abc")).unwrap(), None);
        assert!(r.is_accumulating(Channel::Text));
        assert_eq!(r.feed(&tagged(&[TEXT_LONG_CHUNK], b"def")).unwrap(), None);
        let done = r.feed(&tagged(&[TEXT_LONG_END], b"2")).unwrap();
        assert_eq!(done, Some(Message::Text("abcdef".into())));
        assert!(!r.is_accumulating(Channel::Text));
    }

    #[test]
    fn test_long_data() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.feed(&[DATA_TAG, DATA_LONG_CHUNK, 0, 1]).unwrap(), None);
        assert_eq!(r.feed(&[DATA_TAG, DATA_LONG_CHUNK, 0xff]).unwrap(), None);
        let done = r.feed(&tagged(&[DATA_TAG, DATA_LONG_END], b"2")).unwrap();
        assert_eq!(done, Some(Message::Data(vec![0, 1, 0xff])));
        assert!(!r.is_accumulating(Channel::Data));
    }

    #[test]
    fn test_empty_count_skips_verification() {
        let mut r = Reassembler::new(1024);
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"x")).unwrap();
        let done = r.feed(&[TEXT_LONG_END]).unwrap();
        assert_eq!(done, Some(Message::Text("x".into())));
    }

    #[test]
    fn test_end_without_chunks() {
        let mut r = Reassembler::new(1024);
        let done = r.feed(&tagged(&[DATA_TAG, DATA_LONG_END], b"0")).unwrap();
        assert_eq!(done, Some(Message::Data(vec![])));
    }

    #[test]
    fn test_chunk_count_mismatch() {
        let mut r = Reassembler::new(1024);
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"a")).unwrap();
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"b")).unwrap();
        let err = r.feed(&tagged(&[TEXT_LONG_END], b"3")).unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::ChunkCountMismatch {
                channel: Channel::Text,
                declared: 3,
                received: 2,
            }
        );
        assert!(matches!(BleError::from(err), BleError::ProtocolMismatch(_)));

        // The channel starts fresh afterwards.
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"c")).unwrap();
        let done = r.feed(&tagged(&[TEXT_LONG_END], b"1")).unwrap();
        assert_eq!(done, Some(Message::Text("c".into())));
    }

    #[test]
    fn test_bad_chunk_count() {
        let mut r = Reassembler::new(1024);
        r.feed(&[DATA_TAG, DATA_LONG_CHUNK, 7]).unwrap();
        let err = r.feed(&tagged(&[DATA_TAG, DATA_LONG_END], b"two")).unwrap_err();
        assert_eq!(err.channel(), Channel::Data);
        assert!(matches!(err, ReassemblyError::BadChunkCount { .. }));
    }

    #[test]
    fn test_overflow_abandons_transfer() {
        let mut r = Reassembler::new(4);
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"abc")).unwrap();
        let err = r.feed(&tagged(&[TEXT_LONG_CHUNK], b"de")).unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::Overflow {
                channel: Channel::Text,
                limit: 4
            }
        );
        assert!(!r.is_accumulating(Channel::Text));
        assert_eq!(
            BleError::from(err),
            BleError::BufferOverflow { limit: 4 }
        );
    }

    #[test]
    fn test_channels_are_independent() {
        let mut r = Reassembler::new(1024);
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"long ")).unwrap();
        assert_eq!(
            r.feed(&[DATA_TAG, 9]).unwrap(),
            Some(Message::Data(vec![9]))
        );
        r.feed(&[DATA_TAG, DATA_LONG_CHUNK, 1]).unwrap();
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"print")).unwrap();
        assert_eq!(
            r.feed(&tagged(&[TEXT_LONG_END], b"2")).unwrap(),
            Some(Message::Text("long print".into()))
        );
        assert!(r.is_accumulating(Channel::Data));
        assert_eq!(
            r.feed(&tagged(&[DATA_TAG, DATA_LONG_END], b"1")).unwrap(),
            Some(Message::Data(vec![1]))
        );
    }

    #[test]
    fn test_reset_discards_progress() {
        let mut r = Reassembler::new(1024);
        r.feed(&tagged(&[TEXT_LONG_CHUNK], b"stale")).unwrap();
        r.feed(&[DATA_TAG, DATA_LONG_CHUNK, 1]).unwrap();
        r.reset();
        assert!(!r.is_accumulating(Channel::Text));
        assert!(!r.is_accumulating(Channel::Data));
        assert_eq!(
            r.feed(&tagged(&[TEXT_LONG_END], b"")).unwrap(),
            Some(Message::Text(String::new()))
        );
    }
}
