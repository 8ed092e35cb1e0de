//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or parsing mux traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Header type byte disagrees with the decoded payload
    #[error("Message type mismatch: header says {header:#04x}, payload is {payload:#04x}")]
    TypeMismatch { header: u8, payload: u8 },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Stream index 0 is reserved
    #[error("Reserved stream id 0 used for {0:?}")]
    ReservedStreamId(crate::message::MessageType),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
