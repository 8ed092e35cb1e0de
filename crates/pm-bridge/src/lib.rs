//! pm-bridge: Multiplexing bridge between a local TCP server and peer links
//!
//! The incoming half accepts native-relayed links and fans their streams out
//! to the application server. The outgoing half gives each peer a local
//! listener whose connections ride one multiplexed native link, rebuilding
//! the link transparently when it dies.

pub mod bridge;
pub mod incoming;
pub mod mux;
pub mod native;
pub mod outgoing;
pub mod pipe;
pub mod registry;

pub use bridge::PeerBridge;
pub use incoming::{IncomingBridge, IncomingConnection};
pub use mux::{IncomingStreams, MuxSession, MuxStream, SessionEnd};
pub use native::{LinkStyle, LoopbackNetwork, LoopbackTransport};
pub use outgoing::OutgoingBridge;
pub use registry::{BridgeEvent, ConnectionKey, ConnectionRegistry};
