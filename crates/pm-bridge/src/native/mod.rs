//! Native transport implementations

mod loopback;

pub use loopback::{LinkStyle, LoopbackNetwork, LoopbackTransport};
