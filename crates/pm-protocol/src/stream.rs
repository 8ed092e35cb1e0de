//! Stream identifier type
//!
//! Both ends of a link may open streams, so an index alone is ambiguous. A
//! `StreamId` pairs the index with the side that opened it. On the wire the
//! top bit of the 32-bit id is set when the stream was opened by the
//! *receiver* of the frame, which lets each side allocate indices
//! independently without agreeing on a client/server role first.

use std::fmt;

/// Bit marking "opened by the receiver of this frame"
const RECEIVER_OPENED: u32 = 0x8000_0000;

/// Largest index a side can allocate
pub const MAX_STREAM_INDEX: u32 = RECEIVER_OPENED - 1;

/// Which end of the link opened a stream, from the local point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOrigin {
    /// Opened by this side
    Local,
    /// Opened by the remote side
    Remote,
}

/// Identifier for a logical stream inside a multiplexed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    origin: StreamOrigin,
    index: u32,
}

impl StreamId {
    /// A stream this side opened
    pub fn local(index: u32) -> Self {
        Self {
            origin: StreamOrigin::Local,
            index: index & MAX_STREAM_INDEX,
        }
    }

    /// A stream the remote side opened
    pub fn remote(index: u32) -> Self {
        Self {
            origin: StreamOrigin::Remote,
            index: index & MAX_STREAM_INDEX,
        }
    }

    /// Get the opener's index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get the side that opened the stream
    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    /// Encode for a frame this side is about to send
    pub fn to_wire(&self) -> u32 {
        match self.origin {
            StreamOrigin::Local => self.index,
            StreamOrigin::Remote => self.index | RECEIVER_OPENED,
        }
    }

    /// Decode the id of a frame this side received
    pub fn from_wire(raw: u32) -> Self {
        if raw & RECEIVER_OPENED != 0 {
            Self::local(raw)
        } else {
            Self::remote(raw)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            StreamOrigin::Local => write!(f, "stream-L{}", self.index),
            StreamOrigin::Remote => write!(f, "stream-R{}", self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_display() {
        assert_eq!(format!("{}", StreamId::local(7)), "stream-L7");
        assert_eq!(format!("{}", StreamId::remote(3)), "stream-R3");
    }

    #[test]
    fn test_local_stream_arrives_as_remote() {
        // What one side sends for its own stream is a remote stream to the peer
        let sent = StreamId::local(42).to_wire();
        assert_eq!(StreamId::from_wire(sent), StreamId::remote(42));
    }

    #[test]
    fn test_reply_to_remote_stream_arrives_as_local() {
        let sent = StreamId::remote(42).to_wire();
        assert_eq!(sent & RECEIVER_OPENED, RECEIVER_OPENED);
        assert_eq!(StreamId::from_wire(sent), StreamId::local(42));
    }

    #[test]
    fn test_same_index_both_sides_distinct() {
        assert_ne!(StreamId::local(1), StreamId::remote(1));
    }
}
