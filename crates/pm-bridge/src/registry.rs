//! Connection state registry and consumer events
//!
//! Tracks CONNECTED/DISCONNECTED per incoming connection and per peer session
//! generation, and is the single subscription point for everything the
//! bridge reports.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use pm_core::{ConnectionState, IncomingConnectionId, PeerId};

/// Events published by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    /// An accepted relay connection changed state
    IncomingConnectionState {
        connection_id: IncomingConnectionId,
        state: ConnectionState,
    },

    /// A peer session generation changed state
    PeerSessionState {
        peer_id: PeerId,
        generation: u64,
        state: ConnectionState,
    },

    /// A remote stream could not be routed to the application server
    RouterPortConnectionFailed { router_port: u16, error: String },

    /// Establishing or keeping a peer session failed
    FailedConnection {
        peer_id: PeerId,
        error: String,
        /// Whether the bridge keeps trying for this peer
        recreating: bool,
    },

    /// A peer session came back on a new local port
    ListenerRecreatedAfterFailure { peer_id: PeerId, port_number: u16 },
}

/// Key of a tracked connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    Incoming(IncomingConnectionId),
    Peer { peer_id: PeerId, generation: u64 },
}

impl ConnectionKey {
    fn event(&self, state: ConnectionState) -> BridgeEvent {
        match self {
            ConnectionKey::Incoming(id) => BridgeEvent::IncomingConnectionState {
                connection_id: *id,
                state,
            },
            ConnectionKey::Peer {
                peer_id,
                generation,
            } => BridgeEvent::PeerSessionState {
                peer_id: peer_id.clone(),
                generation: *generation,
                state,
            },
        }
    }
}

/// Registry of connected entities plus the event channel
pub struct ConnectionRegistry {
    /// Keys currently CONNECTED
    states: DashMap<ConnectionKey, ConnectionState>,
    events: broadcast::Sender<BridgeEvent>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            states: DashMap::new(),
            events,
        }
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Publish a non-state event
    pub fn publish(&self, event: BridgeEvent) {
        tracing::debug!("Bridge event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Record a CONNECTED transition
    ///
    /// Returns false if the key is already connected; nothing is emitted then.
    pub fn mark_connected(&self, key: ConnectionKey) -> bool {
        match self.states.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let event = vacant.key().event(ConnectionState::Connected);
                // Publish under the shard lock so a racing disconnect cannot overtake it
                let _guard = vacant.insert(ConnectionState::Connected);
                self.publish(event);
                true
            }
        }
    }

    /// Record a DISCONNECTED transition
    ///
    /// Only the first call for a connected key emits; others are dropped.
    pub fn mark_disconnected(&self, key: &ConnectionKey) -> bool {
        match self.states.remove(key) {
            Some(_) => {
                self.publish(key.event(ConnectionState::Disconnected));
                true
            }
            None => false,
        }
    }

    pub fn state(&self, key: &ConnectionKey) -> ConnectionState {
        if self.states.contains_key(key) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Number of keys currently connected
    pub fn connected_count(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_transition_each_way() {
        let registry = ConnectionRegistry::new(16);
        let mut events = registry.subscribe();
        let key = ConnectionKey::Incoming(IncomingConnectionId(7));

        assert!(registry.mark_connected(key.clone()));
        assert!(!registry.mark_connected(key.clone()));
        assert_eq!(registry.state(&key), ConnectionState::Connected);

        assert!(registry.mark_disconnected(&key));
        assert!(!registry.mark_disconnected(&key));
        assert_eq!(registry.state(&key), ConnectionState::Disconnected);

        assert_eq!(
            events.try_recv().unwrap(),
            BridgeEvent::IncomingConnectionState {
                connection_id: IncomingConnectionId(7),
                state: ConnectionState::Connected,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            BridgeEvent::IncomingConnectionState {
                connection_id: IncomingConnectionId(7),
                state: ConnectionState::Disconnected,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_without_connect_is_dropped() {
        let registry = ConnectionRegistry::new(4);
        let mut events = registry.subscribe();

        let key = ConnectionKey::Peer {
            peer_id: PeerId::from("ghost"),
            generation: 3,
        };
        assert!(!registry.mark_disconnected(&key));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_generations_are_distinct_keys() {
        let registry = ConnectionRegistry::new(8);
        let peer = PeerId::from("p");
        let first = ConnectionKey::Peer {
            peer_id: peer.clone(),
            generation: 1,
        };
        let second = ConnectionKey::Peer {
            peer_id: peer,
            generation: 2,
        };

        assert!(registry.mark_connected(first.clone()));
        assert!(registry.mark_connected(second.clone()));
        assert!(registry.mark_disconnected(&first));
        assert_eq!(registry.state(&second), ConnectionState::Connected);
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let event = BridgeEvent::ListenerRecreatedAfterFailure {
            peer_id: PeerId::from("phone"),
            port_number: 40100,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"listenerRecreatedAfterFailure","peerId":"phone","portNumber":40100}"#
        );
    }
}
