//! Tokio codec for framed protocol messages

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::message::Message;
use crate::stream::StreamId;

/// A complete frame with header and payload
///
/// `stream_id` is always from the local point of view; the header converts
/// to and from the wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: StreamId, message: Message) -> Self {
        Self {
            stream_id,
            message,
        }
    }
}

/// Codec for encoding/decoding protocol frames
///
/// Stateless: a frame is only taken off the buffer once all of it has
/// arrived.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = FrameHeader::peek(&src[..])? else {
            return Ok(None);
        };

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.payload_length);
        let message: Message = bincode::deserialize(&payload)?;

        let decoded_type = message.message_type();
        if decoded_type != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type.as_u8(),
                payload: decoded_type.as_u8(),
            });
        }

        Ok(Some(Frame::new(header.stream_id, message)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        let header =
            FrameHeader::for_payload(frame.stream_id, frame.message.message_type(), payload.len())?;

        header.write_to(dst);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;
    use crate::message::MessageType;
    use bytes::Bytes;

    #[test]
    fn test_codec_data_message_changes_perspective() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(
            StreamId::local(42),
            Message::Data(Bytes::from("Hello, world!")),
        );

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        // The peer decodes our local stream as one it did not open
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream_id, StreamId::remote(42));
        assert_eq!(
            decoded.message,
            Message::Data(Bytes::from_static(b"Hello, world!"))
        );
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(StreamId::remote(9), Message::Close);

        let mut full_buf = BytesMut::new();
        codec.encode(frame, &mut full_buf).unwrap();

        // Split the buffer to simulate partial read
        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.stream_id, StreamId::local(9));
        assert_eq!(decoded.message, Message::Close);
    }

    #[test]
    fn test_codec_payload_split_after_header() {
        let mut codec = FrameCodec::new();

        let mut full_buf = BytesMut::new();
        codec
            .encode(
                Frame::new(StreamId::local(1), Message::Data(Bytes::from(vec![7u8; 100]))),
                &mut full_buf,
            )
            .unwrap();

        let mut partial = full_buf.split_to(HEADER_SIZE + 10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        // Nothing is taken until the whole frame is there
        assert_eq!(partial.len(), HEADER_SIZE + 10);
        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.message, Message::Data(Bytes::from(vec![7u8; 100])));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_rejects_reserved_stream() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(StreamId::local(0), Message::Open), &mut buf)
            .unwrap();

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::ReservedStreamId(MessageType::Open))
        ));
    }

    #[test]
    fn test_codec_rejects_type_mismatch() {
        let mut codec = FrameCodec::new();
        let payload = bincode::serialize(&Message::Reset).unwrap();

        let mut buf = BytesMut::new();
        FrameHeader::for_payload(StreamId::local(3), MessageType::Open, payload.len())
            .unwrap()
            .write_to(&mut buf);
        buf.extend_from_slice(&payload);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }
}
