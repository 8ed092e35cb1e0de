//! Per-peer supervisor: establish, serve, tear down, recreate

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pm_core::{BridgeError, NativeConnectionDescriptor, PeerId};

use crate::mux::{IncomingStreams, MuxSession, MuxStream};
use crate::pipe::{route_to_application, run_pipe};
use crate::registry::{BridgeEvent, ConnectionKey};

use super::backoff::ExponentialBackoff;
use super::{Generation, OutgoingInner, PeerPort, PeerSlot};

/// Everything one generation runs on
struct Link {
    session: MuxSession,
    /// Streams the peer opens; `None` for reverse links, whose relay
    /// connection already routes them
    acceptor: Option<IncomingStreams>,
    listener: TcpListener,
    port: u16,
}

/// Why a generation ended
enum ServeEnd {
    Stopped,
    Terminated,
    LinkFailed(String),
}

impl OutgoingInner {
    /// Native connect plus everything needed to serve a generation
    ///
    /// The listener never reuses `previous_port`.
    async fn establish(
        &self,
        peer_id: &PeerId,
        previous_port: Option<u16>,
    ) -> Result<Link, BridgeError> {
        let descriptor = self.native.connect(peer_id).await?;
        tracing::debug!("Native link to {}: {:?}", peer_id, descriptor);

        let link = self.open_link(peer_id, descriptor, previous_port).await;
        if link.is_err() {
            if let Err(e) = self.native.disconnect(peer_id).await {
                tracing::debug!("Native disconnect from {} failed: {}", peer_id, e);
            }
        }
        link
    }

    async fn open_link(
        &self,
        peer_id: &PeerId,
        descriptor: NativeConnectionDescriptor,
        previous_port: Option<u16>,
    ) -> Result<Link, BridgeError> {
        let (session, acceptor) = if descriptor.is_forward() {
            let port = descriptor.listening_port;
            let dial = TcpStream::connect((self.config.bind_host.as_str(), port));
            let socket = tokio::time::timeout(self.config.connect_timeout, dial)
                .await
                .map_err(|_| BridgeError::PeerUnreachable(format!("timed out dialing port {}", port)))?
                .map_err(|e| BridgeError::PeerUnreachable(format!("port {}: {}", port, e)))?;
            let _ = socket.set_nodelay(true);

            let (session, acceptor) = MuxSession::open(
                socket,
                format!("peer {}", peer_id),
                self.config.outgoing_mux(),
            );
            (session, Some(acceptor))
        } else {
            let session = self
                .incoming
                .claim_reverse(
                    descriptor.client_port,
                    descriptor.server_port,
                    self.config.reverse_connection_wait,
                )
                .await?;
            (session, None)
        };

        match bind_listener(&self.config.bind_host, previous_port).await {
            Ok((listener, port)) => Ok(Link {
                session,
                acceptor,
                listener,
                port,
            }),
            Err(e) => {
                session.destroy();
                Err(e.into())
            }
        }
    }
}

/// Bind an ephemeral listener on a port other than `avoid`
async fn bind_listener(host: &str, avoid: Option<u16>) -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind((host, 0)).await?;
    let port = listener.local_addr()?.port();
    if Some(port) != avoid {
        return Ok((listener, port));
    }

    // Keep the first one bound so the retry lands elsewhere
    let retry = TcpListener::bind((host, 0)).await?;
    let port = retry.local_addr()?.port();
    drop(listener);
    Ok((retry, port))
}

/// Drive one peer slot until it is stopped or gives up
pub(crate) async fn supervise(inner: Arc<OutgoingInner>, slot: Arc<PeerSlot>) {
    let peer_id = slot.peer_id.clone();
    let mut backoff = ExponentialBackoff::from_config(&inner.config.recreate_backoff);
    let mut carried: Vec<TcpStream> = Vec::new();
    let mut recreating = false;
    let mut failures = 0u32;
    let mut previous_port = None;

    let final_state = loop {
        let established = tokio::select! {
            _ = slot.stop.cancelled() => {
                // A connect may have been in flight
                if let Err(e) = inner.native.disconnect(&peer_id).await {
                    tracing::debug!("Native disconnect from {} failed: {}", peer_id, e);
                }
                break PeerPort::Closed;
            }
            established = inner.establish(&peer_id, previous_port) => established,
        };

        let link = match established {
            Ok(link) => link,
            Err(error) if !recreating => {
                tracing::warn!("Failed to connect to peer {}: {}", peer_id, error);
                inner.registry.publish(BridgeEvent::FailedConnection {
                    peer_id: peer_id.clone(),
                    error: error.to_string(),
                    recreating: false,
                });
                break PeerPort::Failed(error);
            }
            Err(error) => {
                failures += 1;
                let giving_up = failures >= inner.config.max_recreate_attempts;
                tracing::warn!(
                    "Recreating session for {} failed (attempt {}): {}",
                    peer_id,
                    failures,
                    error
                );
                inner.registry.publish(BridgeEvent::FailedConnection {
                    peer_id: peer_id.clone(),
                    error: error.to_string(),
                    recreating: !giving_up,
                });
                if giving_up {
                    break PeerPort::Failed(BridgeError::RecreationFailed {
                        peer_id: peer_id.clone(),
                        attempts: failures,
                        last_error: Box::new(error),
                    });
                }

                let delay = backoff.next_delay();
                tokio::select! {
                    _ = slot.stop.cancelled() => break PeerPort::Closed,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        previous_port = Some(link.port);
        let served_since = tokio::time::Instant::now();

        let generation = Arc::new(Generation {
            number: inner.next_generation(),
            port: link.port,
            session: link.session.clone(),
            terminate: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let key = ConnectionKey::Peer {
            peer_id: peer_id.clone(),
            generation: generation.number,
        };

        inner.registry.mark_connected(key.clone());
        slot.port.send_replace(PeerPort::Ready(Arc::clone(&generation)));

        if recreating {
            tracing::info!("Peer {} listener recreated on port {}", peer_id, link.port);
            inner
                .registry
                .publish(BridgeEvent::ListenerRecreatedAfterFailure {
                    peer_id: peer_id.clone(),
                    port_number: link.port,
                });
        } else {
            tracing::info!("Peer {} reachable on local port {}", peer_id, link.port);
        }

        let end = serve(&inner, &slot, &generation, link, &mut carried).await;

        inner.registry.mark_disconnected(&key);
        generation.done.cancel();

        // A generation that outlived the longest backoff clears the failure count
        let short_lived = served_since.elapsed() < inner.config.recreate_backoff.max;
        if !short_lived {
            failures = 0;
            backoff.reset();
        }

        match end {
            ServeEnd::Stopped => break PeerPort::Closed,
            ServeEnd::Terminated => {
                tracing::info!("Generation {} of {} terminated; recreating", generation.number, peer_id);
                failures = 0;
                backoff.reset();
            }
            ServeEnd::LinkFailed(reason) => {
                if short_lived {
                    failures += 1;
                }
                let giving_up = failures >= inner.config.max_recreate_attempts;
                tracing::warn!("Session to {} failed: {}", peer_id, reason);
                inner.registry.publish(BridgeEvent::FailedConnection {
                    peer_id: peer_id.clone(),
                    error: reason.clone(),
                    recreating: !giving_up,
                });
                if giving_up {
                    break PeerPort::Failed(BridgeError::RecreationFailed {
                        peer_id: peer_id.clone(),
                        attempts: failures,
                        last_error: Box::new(BridgeError::PeerUnreachable(reason)),
                    });
                }

                // First retry is immediate
                if failures > 1 {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = slot.stop.cancelled() => break PeerPort::Closed,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        recreating = true;
    };

    // Out of the map first so a new call starts a fresh slot
    inner
        .peers
        .remove_if(&peer_id, |_, existing| Arc::ptr_eq(existing, &slot));
    slot.port.send_replace(final_state);
    drop(carried);
    slot.finished.cancel();

    tracing::debug!("Peer session for {} closed", peer_id);
}

/// Serve one generation, then tear it down
async fn serve(
    inner: &Arc<OutgoingInner>,
    slot: &PeerSlot,
    generation: &Generation,
    link: Link,
    carried: &mut Vec<TcpStream>,
) -> ServeEnd {
    let Link {
        session,
        mut acceptor,
        listener,
        ..
    } = link;
    let target = inner.incoming.application_target();
    let mut pipes = JoinSet::new();
    let pipe_cancel = CancellationToken::new();

    // Connections accepted while the previous generation was closing
    for socket in std::mem::take(carried) {
        wire_local(&session, socket, &mut pipes, &pipe_cancel, carried).await;
    }

    let end = loop {
        tokio::select! {
            _ = slot.stop.cancelled() => break ServeEnd::Stopped,
            _ = generation.terminate.cancelled() => break ServeEnd::Terminated,
            end = session.closed() => break ServeEnd::LinkFailed(end.to_string()),
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    tracing::debug!("Local client {} for peer {}", addr, slot.peer_id);
                    wire_local(&session, socket, &mut pipes, &pipe_cancel, carried).await;
                }
                Err(e) => break ServeEnd::LinkFailed(format!("listener failed: {}", e)),
            },
            stream = next_remote(&mut acceptor) => match stream {
                Some(stream) => match &target {
                    Some(target) => {
                        pipes.spawn(route_to_application(
                            stream,
                            target.clone(),
                            Arc::clone(&inner.registry),
                            pipe_cancel.clone(),
                        ));
                    }
                    None => drop(stream),
                },
                None => acceptor = None,
            },
            Some(_) = pipes.join_next(), if !pipes.is_empty() => {}
        }
    };

    // Callers arriving during teardown wait for the next generation
    slot.port.send_replace(match end {
        ServeEnd::Stopped => PeerPort::Closed,
        _ => PeerPort::Pending,
    });

    drop(listener);
    pipe_cancel.cancel();
    while pipes.join_next().await.is_some() {}

    session.destroy();
    session.closed().await;

    if let Err(e) = inner.native.disconnect(&slot.peer_id).await {
        tracing::debug!("Native disconnect from {} failed: {}", slot.peer_id, e);
    }

    end
}

/// Put a local client on a new stream, or hold it for the next generation
async fn wire_local(
    session: &MuxSession,
    socket: TcpStream,
    pipes: &mut JoinSet<()>,
    cancel: &CancellationToken,
    carried: &mut Vec<TcpStream>,
) {
    if session.is_closed() {
        carried.push(socket);
        return;
    }

    match session.open_stream().await {
        Ok(stream) => {
            let _ = socket.set_nodelay(true);
            pipes.spawn(run_pipe(stream, socket, cancel.clone()));
        }
        Err(e) => {
            tracing::debug!("Holding local client for the next session: {}", e);
            carried.push(socket);
        }
    }
}

async fn next_remote(acceptor: &mut Option<IncomingStreams>) -> Option<MuxStream> {
    match acceptor {
        Some(acceptor) => acceptor.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::config::MuxConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Client socket plus the end a peer listener would have accepted
    async fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (client, accepted)
    }

    #[tokio::test]
    async fn test_client_accepted_while_closing_joins_next_session() {
        let (mut client, accepted) = local_pair().await;
        let pipe_cancel = CancellationToken::new();
        let mut pipes = JoinSet::new();
        let mut carried = Vec::new();

        // Generation on its way out
        let (old_io, _old_far) = tokio::io::duplex(1024);
        let (old, _old_streams) = MuxSession::open(old_io, "old", MuxConfig::default());
        old.destroy();

        wire_local(&old, accepted, &mut pipes, &pipe_cancel, &mut carried).await;
        assert_eq!(carried.len(), 1);
        assert!(pipes.is_empty());

        // The next generation picks the held client up
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (next, _next_streams) = MuxSession::open(near, "next", MuxConfig::default());
        let (_peer, mut peer_streams) = MuxSession::open(far, "peer", MuxConfig::default());

        for socket in std::mem::take(&mut carried) {
            wire_local(&next, socket, &mut pipes, &pipe_cancel, &mut carried).await;
        }
        assert!(carried.is_empty());
        assert_eq!(pipes.len(), 1);

        client.write_all(b"held").await.unwrap();
        let mut stream = peer_streams.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"held");

        stream.write_all(b"back").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }
}
