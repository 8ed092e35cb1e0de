//! Native transport seam
//!
//! The radio layer (Bluetooth, Wi-Fi Direct, a test double) sits behind this
//! trait. It carries exactly one byte stream per peer and knows nothing about
//! multiplexing.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::NativeError;
use crate::types::{NativeConnectionDescriptor, PeerAvailability, PeerId};

/// Abstraction over the platform's peer-to-peer link layer
#[async_trait]
pub trait NativeTransport: Send + Sync {
    /// Begin listening for peer advertisements; required before `connect`
    async fn start_listening_for_advertisements(&self) -> Result<(), NativeError>;

    /// Stop listening for peer advertisements
    async fn stop_listening_for_advertisements(&self) -> Result<(), NativeError>;

    /// Advertise this node and relay inbound native links to `port`
    async fn start_advertising_and_listening(&self, port: u16) -> Result<(), NativeError>;

    /// Stop advertising and refuse new inbound links
    async fn stop_advertising_and_listening(&self) -> Result<(), NativeError>;

    /// Establish a native link to `peer_id`
    ///
    /// Returns `AlreadyConnecting` while a previous link to the same peer is
    /// still open.
    async fn connect(&self, peer_id: &PeerId) -> Result<NativeConnectionDescriptor, NativeError>;

    /// Release the native link to `peer_id`, if any
    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), NativeError>;

    /// Subscribe to batches of peer availability changes
    fn subscribe_peer_availability(&self) -> broadcast::Receiver<Vec<PeerAvailability>>;
}
