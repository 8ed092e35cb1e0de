//! Core error types for peermux
//!
//! Bridge errors are `Clone` because a single failed peer connect is reported
//! to every caller waiting on the same peer.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::types::PeerId;

/// Errors returned by the native transport
///
/// The display strings are part of the native contract and are surfaced to
/// callers unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    /// A connect for this peer is already outstanding or established
    #[error("Already connect(ing/ed)")]
    AlreadyConnecting,

    /// `connect` was called before listening for advertisements started
    #[error("startListeningForAdvertisements is not active")]
    ListeningNotActive,

    /// The peer could not be reached
    #[error("Connection could not be established")]
    ConnectionFailed,

    /// Any other native failure
    #[error("{0}")]
    Other(String),
}

/// Multiplexed session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The session has ended and cannot open streams
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// This side has used every stream index
    #[error("Stream ids exhausted")]
    StreamIdsExhausted,
}

/// Errors surfaced by the bridge operations
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Operation called before `start`
    #[error("Call Start!")]
    NotStarted,

    /// Operation called after `stop`
    #[error("We are stopped!")]
    Stopped,

    /// Native transport error, passed through verbatim
    #[error(transparent)]
    Native(#[from] NativeError),

    /// The native layer returned a port we could not dial
    #[error("Cannot Connect To Peer: {0}")]
    PeerUnreachable(String),

    /// Reverse connection names a relay port that is not ours
    #[error("Mismatched serverPort: expected {expected}, got {actual}")]
    MismatchedServerPort { expected: u16, actual: u16 },

    /// Reverse connection whose relay socket never turned up
    #[error("Incoming connection died: no relay socket from port {client_port}")]
    ReverseConnectionMissing { client_port: u16 },

    /// The peer listener was removed while the caller was waiting
    #[error("Peer listener for {0} was closed")]
    PeerListenerClosed(PeerId),

    /// Recreating a failed peer session did not succeed
    #[error("Gave up recreating session for {peer_id} after {attempts} attempts: {last_error}")]
    RecreationFailed {
        peer_id: PeerId,
        attempts: u32,
        last_error: Box<BridgeError>,
    },

    /// Multiplexed session error
    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(Arc::new(err))
    }
}

impl BridgeError {
    /// Whether this error is the native "busy" refusal
    pub fn is_busy(&self) -> bool {
        matches!(self, BridgeError::Native(NativeError::AlreadyConnecting))
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_messages() {
        assert_eq!(BridgeError::NotStarted.to_string(), "Call Start!");
        assert_eq!(BridgeError::Stopped.to_string(), "We are stopped!");
    }

    #[test]
    fn test_native_errors_pass_through_verbatim() {
        let err: BridgeError = NativeError::AlreadyConnecting.into();
        assert_eq!(err.to_string(), "Already connect(ing/ed)");
        assert!(err.is_busy());

        let err: BridgeError = NativeError::ListeningNotActive.into();
        assert_eq!(
            err.to_string(),
            "startListeningForAdvertisements is not active"
        );
        assert!(!err.is_busy());
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err: BridgeError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
