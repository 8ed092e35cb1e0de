//! pm-core: Core abstractions and configuration for peermux
//!
//! This crate provides the shared types, error taxonomy, configuration
//! structures and the native-transport trait used by the bridge.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{BridgeError, ConfigError, MuxError, NativeError};
pub use types::{
    BridgeState, ConnectionState, IncomingConnectionId, NativeConnectionDescriptor,
    PeerAvailability, PeerId,
};
