//! Bridge facade tying the incoming and outgoing halves together

use std::sync::Arc;

use tokio::sync::broadcast;

use pm_core::config::BridgeConfig;
use pm_core::traits::NativeTransport;
use pm_core::{BridgeError, BridgeState, IncomingConnectionId, PeerId};

use crate::incoming::IncomingBridge;
use crate::outgoing::OutgoingBridge;
use crate::registry::{BridgeEvent, ConnectionRegistry};

/// A bridge node: relay listener, peer sessions and the event stream
pub struct PeerBridge {
    config: Arc<BridgeConfig>,
    registry: Arc<ConnectionRegistry>,
    incoming: Arc<IncomingBridge>,
    outgoing: OutgoingBridge,
}

impl PeerBridge {
    pub fn new(config: BridgeConfig, native: Arc<dyn NativeTransport>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new(config.event_capacity));
        let incoming = Arc::new(IncomingBridge::new(
            Arc::clone(&config),
            Arc::clone(&registry),
        ));
        let outgoing = OutgoingBridge::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            native,
            Arc::clone(&incoming),
        );

        Self {
            config,
            registry,
            incoming,
            outgoing,
        }
    }

    /// Subscribe to every bridge event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.registry.subscribe()
    }

    /// Start the relay listener; returns the relay port
    pub async fn start(&self, application_port: u16) -> Result<u16, BridgeError> {
        self.incoming.start(application_port).await
    }

    /// Tear down every peer session, then the relay and its connections
    pub async fn stop(&self) -> Result<(), BridgeError> {
        match self.incoming.state() {
            BridgeState::Created | BridgeState::Starting => return Err(BridgeError::NotStarted),
            BridgeState::Stopped => return Ok(()),
            BridgeState::Started | BridgeState::Stopping => {}
        }

        self.outgoing.stop().await;
        self.incoming.stop().await
    }

    /// Local port reaching `peer_id`; see [`OutgoingBridge::create_peer_listener`]
    pub async fn create_peer_listener(&self, peer_id: &PeerId) -> Result<u16, BridgeError> {
        self.outgoing.create_peer_listener(peer_id).await
    }

    /// Tear down one relay connection; an unknown id is a no-op once started
    pub async fn terminate_incoming_connection(
        &self,
        id: IncomingConnectionId,
    ) -> Result<(), BridgeError> {
        self.ensure_started()?;
        self.incoming.terminate_incoming_connection(id).await;
        Ok(())
    }

    /// Rebuild the peer session listening on `port`; a stale port or unknown
    /// peer is a no-op once started
    pub async fn terminate_outgoing_connection(
        &self,
        peer_id: &PeerId,
        port: u16,
    ) -> Result<(), BridgeError> {
        self.ensure_started()?;
        self.outgoing
            .terminate_outgoing_connection(peer_id, port)
            .await;
        Ok(())
    }

    pub async fn remove_peer_listener(&self, peer_id: &PeerId) {
        self.outgoing.remove_peer_listener(peer_id).await;
    }

    pub fn state(&self) -> BridgeState {
        self.incoming.state()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn incoming(&self) -> &IncomingBridge {
        &self.incoming
    }

    pub fn outgoing(&self) -> &OutgoingBridge {
        &self.outgoing
    }

    fn ensure_started(&self) -> Result<(), BridgeError> {
        match self.incoming.state() {
            BridgeState::Started => Ok(()),
            BridgeState::Created | BridgeState::Starting => Err(BridgeError::NotStarted),
            BridgeState::Stopping | BridgeState::Stopped => Err(BridgeError::Stopped),
        }
    }
}

impl std::fmt::Debug for PeerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerBridge")
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}
