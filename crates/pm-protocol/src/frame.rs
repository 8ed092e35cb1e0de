//! Frame header
//!
//! Every frame starts with two big-endian words:
//!
//! ```text
//! 0          4    5            8
//! +----------+----+------------+
//! | stream   |type| length     |
//! +----------+----+------------+
//! ```
//!
//! The stream word is written from the sender's point of view and read back
//! from the receiver's, see [`StreamId::to_wire`]. The second word packs the
//! message type into its high byte and the payload length into the low 24
//! bits.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

const LENGTH_MASK: u32 = MAX_PAYLOAD_SIZE as u32;

/// Parsed frame header, stream id already in local perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub message_type: MessageType,
    pub payload_length: usize,
}

impl FrameHeader {
    /// Header for a payload this side is about to send
    pub fn for_payload(
        stream_id: StreamId,
        message_type: MessageType,
        payload_length: usize,
    ) -> Result<Self, ProtocolError> {
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            stream_id,
            message_type,
            payload_length,
        })
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        let kind = u32::from(self.message_type.as_u8()) << 24;
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.stream_id.to_wire());
        dst.put_u32(kind | self.payload_length as u32);
    }

    /// Parse the header at the front of `src` without consuming anything
    ///
    /// `Ok(None)` means fewer than [`HEADER_SIZE`] bytes are buffered. Stream
    /// index 0 and unknown type bytes are rejected here, before any payload
    /// is buffered for them.
    pub fn peek(src: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Some(mut raw) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let wire_stream = raw.get_u32();
        let word = raw.get_u32();

        let type_byte = (word >> 24) as u8;
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        let stream_id = StreamId::from_wire(wire_stream);
        if stream_id.index() == 0 {
            return Err(ProtocolError::ReservedStreamId(message_type));
        }

        Ok(Some(Self {
            stream_id,
            message_type,
            payload_length: (word & LENGTH_MASK) as usize,
        }))
    }

    /// Header plus payload
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes() {
        let header = FrameHeader::for_payload(StreamId::local(5), MessageType::Data, 0x0102).unwrap();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        assert_eq!(&buf[..], &[0, 0, 0, 5, 0x02, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_reply_header_sets_receiver_bit() {
        let header = FrameHeader::for_payload(StreamId::remote(5), MessageType::Close, 0).unwrap();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf[0], 0x80);

        // The other side reads it back as its own stream
        let parsed = FrameHeader::peek(&buf).unwrap().unwrap();
        assert_eq!(parsed.stream_id, StreamId::local(5));
        assert_eq!(parsed.message_type, MessageType::Close);
        assert_eq!(parsed.frame_len(), HEADER_SIZE);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let buf = [0u8, 0, 0, 1, 0x01, 0, 0];
        assert!(FrameHeader::peek(&buf).unwrap().is_none());

        let buf = [0u8, 0, 0, 1, 0x01, 0, 0, 0, 0xAA];
        let header = FrameHeader::peek(&buf).unwrap().unwrap();
        assert_eq!(header.stream_id, StreamId::remote(1));
        assert_eq!(header.payload_length, 0);
    }

    #[test]
    fn test_max_length_fits() {
        let header =
            FrameHeader::for_payload(StreamId::local(1), MessageType::Data, MAX_PAYLOAD_SIZE).unwrap();
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(
            FrameHeader::peek(&buf).unwrap().unwrap().payload_length,
            MAX_PAYLOAD_SIZE
        );

        assert!(matches!(
            FrameHeader::for_payload(StreamId::local(1), MessageType::Data, MAX_PAYLOAD_SIZE + 1),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_type_and_reserved_stream() {
        assert!(matches!(
            FrameHeader::peek(&[0, 0, 0, 1, 0xFE, 0, 0, 10]),
            Err(ProtocolError::UnknownMessageType(0xFE))
        ));
        assert!(matches!(
            FrameHeader::peek(&[0x80, 0, 0, 0, 0x04, 0, 0, 0]),
            Err(ProtocolError::ReservedStreamId(MessageType::Reset))
        ));
    }
}
