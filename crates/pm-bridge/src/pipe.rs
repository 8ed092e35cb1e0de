//! Stream pipes: one logical stream spliced to one local TCP connection

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::mux::MuxStream;
use crate::registry::{BridgeEvent, ConnectionRegistry};

/// Where remote-opened streams are delivered
#[derive(Debug, Clone)]
pub struct ApplicationTarget {
    pub host: Arc<str>,
    pub port: u16,
    pub connect_timeout: Duration,
}

/// Copy bytes both ways until both directions finish, one side fails or
/// `cancel` fires
///
/// Both halves are owned here and dropped exactly once on return.
pub async fn run_pipe(mut stream: MuxStream, mut socket: TcpStream, cancel: CancellationToken) {
    let id = stream.id();

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Pipe for {} cancelled", id);
        }
        result = tokio::io::copy_bidirectional(&mut stream, &mut socket) => match result {
            Ok((to_local, to_remote)) => {
                tracing::trace!(
                    "Pipe for {} finished: {} bytes in, {} bytes out",
                    id,
                    to_local,
                    to_remote
                );
            }
            Err(e) => {
                tracing::debug!("Pipe for {} ended with error: {}", id, e);
            }
        }
    }
}

/// Dial the application server for a remote-opened stream and pipe them
///
/// A failed dial destroys only this stream and emits
/// [`BridgeEvent::RouterPortConnectionFailed`].
pub async fn route_to_application(
    stream: MuxStream,
    target: ApplicationTarget,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    let dial = tokio::time::timeout(
        target.connect_timeout,
        TcpStream::connect((target.host.as_ref(), target.port)),
    );

    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = dial => dialed,
    };

    let error = match dialed {
        Ok(Ok(socket)) => {
            let _ = socket.set_nodelay(true);
            run_pipe(stream, socket, cancel).await;
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", target.connect_timeout),
    };

    tracing::warn!(
        "Failed to reach application port {} for {}: {}",
        target.port,
        stream.id(),
        error
    );
    drop(stream);
    registry.publish(BridgeEvent::RouterPortConnectionFailed {
        router_port: target.port,
        error,
    });
}
