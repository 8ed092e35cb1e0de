//! Loopback native transport
//!
//! Stands in for the radio layer with plain TCP on one host. Peers find each
//! other through a shared [`LoopbackNetwork`] directory, filled either by
//! in-process transports advertising their relay ports or from static
//! configuration.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use pm_core::traits::NativeTransport;
use pm_core::{NativeConnectionDescriptor, NativeError, PeerAvailability, PeerId};

/// Directory of advertised peers
pub struct LoopbackNetwork {
    peers: DashMap<PeerId, SocketAddr>,
    availability: broadcast::Sender<Vec<PeerAvailability>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        let (availability, _) = broadcast::channel(64);
        Arc::new(Self {
            peers: DashMap::new(),
            availability,
        })
    }

    /// Make `peer_id` reachable at `relay_addr`
    pub fn register(&self, peer_id: PeerId, relay_addr: SocketAddr) {
        tracing::debug!("Peer {} advertised at {}", peer_id, relay_addr);
        self.peers.insert(peer_id.clone(), relay_addr);
        let _ = self.availability.send(vec![PeerAvailability {
            peer_id,
            available: true,
        }]);
    }

    pub fn unregister(&self, peer_id: &PeerId) {
        if self.peers.remove(peer_id).is_some() {
            let _ = self.availability.send(vec![PeerAvailability {
                peer_id: peer_id.clone(),
                available: false,
            }]);
        }
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<SocketAddr> {
        self.peers.get(peer_id).map(|addr| *addr)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<PeerAvailability>> {
        self.availability.subscribe()
    }
}

/// How `connect` hands the link to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStyle {
    /// Return a local port to dial
    #[default]
    Forward,
    /// Connect into our own relay and return the socket's source port
    Reverse,
}

struct ActiveLink {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TransportState {
    listening: bool,
    advertised_port: Option<u16>,
    links: HashMap<PeerId, ActiveLink>,
}

/// [`NativeTransport`] over localhost TCP
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local_peer: PeerId,
    style: LinkStyle,
    host: IpAddr,
    state: Arc<Mutex<TransportState>>,
    connect_calls: AtomicUsize,
    next_link: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(network: Arc<LoopbackNetwork>, local_peer: PeerId, style: LinkStyle) -> Self {
        Self {
            network,
            local_peer,
            style,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            state: Arc::new(Mutex::new(TransportState::default())),
            connect_calls: AtomicUsize::new(0),
            next_link: AtomicU64::new(1),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Number of `connect` calls so far, successful or not
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of links currently open
    pub async fn active_links(&self) -> usize {
        self.state.lock().await.links.len()
    }

    async fn forward(
        &self,
        peer_id: &PeerId,
        remote: SocketAddr,
        link: u64,
        cancel: CancellationToken,
    ) -> Result<NativeConnectionDescriptor, NativeError> {
        let proxy = TcpListener::bind((self.host, 0))
            .await
            .map_err(|e| NativeError::Other(e.to_string()))?;
        let port = proxy
            .local_addr()
            .map_err(|e| NativeError::Other(e.to_string()))?
            .port();

        let state = Arc::clone(&self.state);
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => None,
                accepted = proxy.accept() => accepted.ok(),
            };
            drop(proxy);

            if let Some((local, _)) = accepted {
                let upstream = tokio::select! {
                    _ = cancel.cancelled() => None,
                    upstream = TcpStream::connect(remote) => upstream.ok(),
                };
                match upstream {
                    Some(upstream) => relay(local, upstream, &cancel).await,
                    None => tracing::debug!("Peer {} relay at {} refused", peer_id, remote),
                }
            }
            release(&state, &peer_id, link).await;
        });

        Ok(NativeConnectionDescriptor::forward(port))
    }

    async fn reverse(
        &self,
        peer_id: &PeerId,
        remote: SocketAddr,
        own_relay: u16,
        link: u64,
        cancel: CancellationToken,
    ) -> Result<NativeConnectionDescriptor, NativeError> {
        let upstream = TcpStream::connect(remote)
            .await
            .map_err(|_| NativeError::ConnectionFailed)?;
        let to_self = TcpStream::connect((self.host, own_relay))
            .await
            .map_err(|e| NativeError::Other(e.to_string()))?;
        let client_port = to_self
            .local_addr()
            .map_err(|e| NativeError::Other(e.to_string()))?
            .port();

        let state = Arc::clone(&self.state);
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            relay(to_self, upstream, &cancel).await;
            release(&state, &peer_id, link).await;
        });

        Ok(NativeConnectionDescriptor::reverse(client_port, own_relay))
    }
}

async fn relay(mut a: TcpStream, mut b: TcpStream, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => {
            if let Err(e) = result {
                tracing::trace!("Loopback relay ended: {}", e);
            }
        }
    }
}

/// Forget a finished link unless it has already been replaced
async fn release(state: &Mutex<TransportState>, peer_id: &PeerId, link: u64) {
    let mut state = state.lock().await;
    if state.links.get(peer_id).is_some_and(|l| l.id == link) {
        state.links.remove(peer_id);
    }
}

#[async_trait]
impl NativeTransport for LoopbackTransport {
    async fn start_listening_for_advertisements(&self) -> Result<(), NativeError> {
        self.state.lock().await.listening = true;
        Ok(())
    }

    async fn stop_listening_for_advertisements(&self) -> Result<(), NativeError> {
        self.state.lock().await.listening = false;
        Ok(())
    }

    async fn start_advertising_and_listening(&self, port: u16) -> Result<(), NativeError> {
        self.state.lock().await.advertised_port = Some(port);
        self.network
            .register(self.local_peer.clone(), SocketAddr::new(self.host, port));
        Ok(())
    }

    async fn stop_advertising_and_listening(&self) -> Result<(), NativeError> {
        self.state.lock().await.advertised_port = None;
        self.network.unregister(&self.local_peer);
        Ok(())
    }

    async fn connect(&self, peer_id: &PeerId) -> Result<NativeConnectionDescriptor, NativeError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        if !state.listening {
            return Err(NativeError::ListeningNotActive);
        }
        if state.links.contains_key(peer_id) {
            return Err(NativeError::AlreadyConnecting);
        }
        let remote = self
            .network
            .lookup(peer_id)
            .ok_or(NativeError::ConnectionFailed)?;

        let link = self.next_link.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let descriptor = match self.style {
            LinkStyle::Forward => self.forward(peer_id, remote, link, cancel.clone()).await?,
            LinkStyle::Reverse => {
                let own_relay = state.advertised_port.ok_or_else(|| {
                    NativeError::Other("reverse links need an advertised relay".to_string())
                })?;
                self.reverse(peer_id, remote, own_relay, link, cancel.clone())
                    .await?
            }
        };

        state
            .links
            .insert(peer_id.clone(), ActiveLink { id: link, cancel });
        Ok(descriptor)
    }

    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), NativeError> {
        if let Some(link) = self.state.lock().await.links.remove(peer_id) {
            tracing::debug!("Closing loopback link {} to {}", link.id, peer_id);
            link.cancel.cancel();
        }
        Ok(())
    }

    fn subscribe_peer_availability(&self) -> broadcast::Receiver<Vec<PeerAvailability>> {
        self.network.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_relay() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_requires_listening() {
        let network = LoopbackNetwork::new();
        let transport = LoopbackTransport::new(network, PeerId::from("a"), LinkStyle::Forward);

        let err = transport.connect(&PeerId::from("b")).await.unwrap_err();
        assert_eq!(err, NativeError::ListeningNotActive);
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_fails() {
        let network = LoopbackNetwork::new();
        let transport = LoopbackTransport::new(network, PeerId::from("a"), LinkStyle::Forward);
        transport.start_listening_for_advertisements().await.unwrap();

        let err = transport.connect(&PeerId::from("nobody")).await.unwrap_err();
        assert_eq!(err, NativeError::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_forward_link_relays_and_refuses_second_connect() {
        let network = LoopbackNetwork::new();
        network.register(PeerId::from("b"), echo_relay().await);
        let transport =
            LoopbackTransport::new(Arc::clone(&network), PeerId::from("a"), LinkStyle::Forward);
        transport.start_listening_for_advertisements().await.unwrap();

        let peer = PeerId::from("b");
        let descriptor = transport.connect(&peer).await.unwrap();
        assert!(descriptor.is_forward());
        assert_eq!(
            transport.connect(&peer).await.unwrap_err(),
            NativeError::AlreadyConnecting
        );

        let mut socket = TcpStream::connect(("127.0.0.1", descriptor.listening_port))
            .await
            .unwrap();
        socket.write_all(b"over the air").await.unwrap();
        let mut buf = [0u8; 12];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the air");

        transport.disconnect(&peer).await.unwrap();
        assert_eq!(transport.active_links().await, 0);
        assert!(transport.connect(&peer).await.is_ok());
    }

    #[tokio::test]
    async fn test_advertising_publishes_availability() {
        let network = LoopbackNetwork::new();
        let transport =
            LoopbackTransport::new(Arc::clone(&network), PeerId::from("a"), LinkStyle::Forward);
        let mut availability = transport.subscribe_peer_availability();

        transport.start_advertising_and_listening(4100).await.unwrap();
        let batch = availability.recv().await.unwrap();
        assert_eq!(batch[0].peer_id, PeerId::from("a"));
        assert!(batch[0].available);
        assert_eq!(
            network.lookup(&PeerId::from("a")),
            Some(SocketAddr::from(([127, 0, 0, 1], 4100)))
        );

        transport.stop_advertising_and_listening().await.unwrap();
        let batch = availability.recv().await.unwrap();
        assert!(!batch[0].available);
        assert_eq!(network.lookup(&PeerId::from("a")), None);
    }
}
