//! pm-protocol: Wire protocol for peermux stream multiplexing
//!
//! This crate defines the binary framing used to carry many logical byte
//! streams over one native peer-to-peer link.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod stream;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Message, MessageType};
pub use stream::{StreamId, StreamOrigin, MAX_STREAM_INDEX};
