//! Message types for the peermux protocol
//!
//! Every frame carries one message addressed to one logical stream.
//!
//! # Stream lifecycle
//!
//! 1. The opener sends `Open` for a fresh index
//! 2. `Data` flows in both directions
//! 3. Each side sends `Close` when it has nothing more to write (half-close)
//! 4. Either side may send `Reset` to abandon the stream immediately
//!
//! There is no acknowledgement for `Open`; data may follow it right away.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Open a new stream
    Open = 0x01,
    /// Stream payload
    Data = 0x02,
    /// Sender will not write any more on this stream
    Close = 0x03,
    /// Abort the stream in both directions
    Reset = 0x04,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Close),
            0x04 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Open a stream
    Open,

    /// Stream bytes
    Data(Bytes),

    /// Half-close the sender's direction
    Close,

    /// Abort the stream
    Reset,
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open => MessageType::Open,
            Message::Data(_) => MessageType::Data,
            Message::Close => MessageType::Close,
            Message::Reset => MessageType::Reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_bytes() {
        for msg_type in [
            MessageType::Open,
            MessageType::Data,
            MessageType::Close,
            MessageType::Reset,
        ] {
            assert_eq!(MessageType::from_u8(msg_type.as_u8()), Some(msg_type));
        }
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0xFF), None);
    }

    #[test]
    fn test_message_type_of_data() {
        let msg = Message::Data(Bytes::from_static(b"abc"));
        assert_eq!(msg.message_type(), MessageType::Data);
    }
}
