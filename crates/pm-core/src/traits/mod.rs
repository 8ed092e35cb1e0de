//! Core trait definitions

mod native;

pub use native::NativeTransport;
