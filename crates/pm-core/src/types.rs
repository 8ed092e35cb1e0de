//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote peer as reported by the native layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a connection accepted by the incoming bridge
///
/// Allocated monotonically and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncomingConnectionId(pub u64);

impl fmt::Display for IncomingConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incoming-{}", self.0)
    }
}

/// Result of a native connect
///
/// A non-zero `listening_port` is a forward connection that should be dialed
/// on localhost. Zero means reverse: the peer has already connected into our
/// relay listener from `client_port`, and `server_port` names that listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeConnectionDescriptor {
    pub listening_port: u16,
    pub client_port: u16,
    pub server_port: u16,
}

impl NativeConnectionDescriptor {
    /// Descriptor for a forward connection
    pub fn forward(listening_port: u16) -> Self {
        Self {
            listening_port,
            client_port: 0,
            server_port: 0,
        }
    }

    /// Descriptor for a reverse connection
    pub fn reverse(client_port: u16, server_port: u16) -> Self {
        Self {
            listening_port: 0,
            client_port,
            server_port,
        }
    }

    pub fn is_forward(&self) -> bool {
        self.listening_port != 0
    }
}

/// State of a tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Lifecycle of the relay listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    /// Constructed, never started
    Created,
    /// `start` in progress
    Starting,
    /// Relay listener is accepting
    Started,
    /// `stop` in progress
    Stopping,
    /// Terminal
    Stopped,
}

impl BridgeState {
    pub fn is_started(&self) -> bool {
        matches!(self, BridgeState::Started)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Created => "created",
            BridgeState::Starting => "starting",
            BridgeState::Started => "started",
            BridgeState::Stopping => "stopping",
            BridgeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Availability change reported by the native layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAvailability {
    pub peer_id: PeerId,
    pub available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_direction() {
        assert!(NativeConnectionDescriptor::forward(4242).is_forward());

        let reverse = NativeConnectionDescriptor::reverse(50123, 9000);
        assert!(!reverse.is_forward());
        assert_eq!(reverse.listening_port, 0);
        assert_eq!(reverse.server_port, 9000);
    }

    #[test]
    fn test_descriptor_json_field_names() {
        let json = serde_json::to_string(&NativeConnectionDescriptor::forward(7)).unwrap();
        assert_eq!(json, r#"{"listeningPort":7,"clientPort":0,"serverPort":0}"#);
    }

    #[test]
    fn test_connection_state_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disconnected).unwrap(),
            r#""DISCONNECTED""#
        );
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
    }

    #[test]
    fn test_peer_id_is_transparent() {
        let id = PeerId::from("peer-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""peer-a""#);
        assert_eq!(id.as_str(), "peer-a");
    }
}
