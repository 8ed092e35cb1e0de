//! Multiplexed sessions
//!
//! A [`MuxSession`] carries many independent byte streams over one duplex
//! connection using the `pm-protocol` framing. Either end may open streams.

mod session;
mod stream;

pub use session::{IncomingStreams, MuxSession, SessionEnd};
pub use stream::MuxStream;
