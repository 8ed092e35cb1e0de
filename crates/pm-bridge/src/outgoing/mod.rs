//! Outgoing bridge: one peer session per peer id
//!
//! For every peer the application wants to reach, the bridge keeps a native
//! link, a multiplexed session over it and a local listener. Each local
//! client connection becomes one stream on the session. When the link dies
//! the whole generation is torn down and rebuilt on a fresh port.

mod backoff;
mod supervisor;

pub use backoff::ExponentialBackoff;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use pm_core::config::BridgeConfig;
use pm_core::time::monotonic_millis;
use pm_core::traits::NativeTransport;
use pm_core::{BridgeError, BridgeState, PeerId};

use crate::incoming::IncomingBridge;
use crate::mux::MuxSession;
use crate::registry::ConnectionRegistry;

/// One live generation of a peer session
pub(crate) struct Generation {
    number: u64,
    port: u16,
    session: MuxSession,
    /// Requests teardown of this generation only
    terminate: CancellationToken,
    /// Cancelled once this generation is fully torn down
    done: CancellationToken,
}

/// What callers waiting on a peer observe
#[derive(Clone)]
pub(crate) enum PeerPort {
    /// Connecting, or recreating after a failure
    Pending,
    Ready(Arc<Generation>),
    Failed(BridgeError),
    /// Removed or stopped
    Closed,
}

/// Single-flight slot for one peer id
///
/// Every caller attaches to the slot's watch; only the slot's supervisor
/// talks to the native layer.
pub(crate) struct PeerSlot {
    peer_id: PeerId,
    stop: CancellationToken,
    finished: CancellationToken,
    port: watch::Sender<PeerPort>,
    created_at: u64,
}

impl PeerSlot {
    fn new(peer_id: PeerId) -> Self {
        let (port, _) = watch::channel(PeerPort::Pending);
        Self {
            peer_id,
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
            port,
            created_at: monotonic_millis(),
        }
    }

    fn current(&self) -> Option<Arc<Generation>> {
        match &*self.port.borrow() {
            PeerPort::Ready(generation) => Some(Arc::clone(generation)),
            _ => None,
        }
    }

    fn last_activity(&self) -> u64 {
        self.current()
            .map(|g| g.session.last_activity_millis())
            .unwrap_or(self.created_at)
    }

    /// Wait until the slot has a port or has failed
    async fn wait_port(&self) -> Result<u16, BridgeError> {
        let mut rx = self.port.subscribe();
        let state = rx
            .wait_for(|p| !matches!(p, PeerPort::Pending))
            .await
            .map(|p| (*p).clone());

        match state {
            Ok(PeerPort::Ready(generation)) => Ok(generation.port),
            Ok(PeerPort::Failed(error)) => Err(error),
            _ => Err(BridgeError::PeerListenerClosed(self.peer_id.clone())),
        }
    }

    /// Stop the supervisor and wait for its teardown
    async fn shut_down(&self) {
        self.stop.cancel();
        self.finished.cancelled().await;
    }
}

/// State shared with the per-peer supervisors
pub(crate) struct OutgoingInner {
    config: Arc<BridgeConfig>,
    registry: Arc<ConnectionRegistry>,
    native: Arc<dyn NativeTransport>,
    incoming: Arc<IncomingBridge>,
    peers: DashMap<PeerId, Arc<PeerSlot>>,
    /// Global so a recreated session never shares a number with its predecessor
    generations: AtomicU64,
    closing: CancellationToken,
}

/// Manager of all peer sessions
pub struct OutgoingBridge {
    inner: Arc<OutgoingInner>,
}

impl OutgoingBridge {
    pub fn new(
        config: Arc<BridgeConfig>,
        registry: Arc<ConnectionRegistry>,
        native: Arc<dyn NativeTransport>,
        incoming: Arc<IncomingBridge>,
    ) -> Self {
        Self {
            inner: Arc::new(OutgoingInner {
                config,
                registry,
                native,
                incoming,
                peers: DashMap::new(),
                generations: AtomicU64::new(0),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// Local port whose connections reach `peer_id`
    ///
    /// Idempotent: an existing session's current port is returned without a
    /// new native connect, and concurrent first calls share one connect.
    pub async fn create_peer_listener(&self, peer_id: &PeerId) -> Result<u16, BridgeError> {
        self.ensure_started()?;
        let slot = self.slot_for(peer_id).await;
        slot.wait_port().await
    }

    /// Close the generation listening on `port` so it is rebuilt
    ///
    /// A stale port or unknown peer is a no-op.
    pub async fn terminate_outgoing_connection(&self, peer_id: &PeerId, port: u16) {
        let slot = self.inner.peers.get(peer_id).map(|s| Arc::clone(s.value()));
        let Some(slot) = slot else {
            tracing::debug!("No peer session for {}; nothing to terminate", peer_id);
            return;
        };

        match slot.current() {
            Some(generation) if generation.port == port => {
                tracing::info!(
                    "Terminating generation {} of {} on port {}",
                    generation.number,
                    peer_id,
                    port
                );
                generation.terminate.cancel();
                generation.done.cancelled().await;
            }
            _ => {
                tracing::debug!("Port {} is not current for {}; ignoring", port, peer_id);
            }
        }
    }

    /// Tear a peer down without recreating it
    pub async fn remove_peer_listener(&self, peer_id: &PeerId) {
        let slot = self.inner.peers.get(peer_id).map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            slot.shut_down().await;
        }
    }

    /// Tear every peer down and refuse new ones
    pub async fn stop(&self) {
        self.inner.closing.cancel();

        let slots: Vec<Arc<PeerSlot>> = self
            .inner
            .peers
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();
        futures::future::join_all(slots.iter().map(|s| s.shut_down())).await;
    }

    /// Peers with a live or pending session
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .inner
            .peers
            .iter()
            .filter(|s| !s.stop.is_cancelled())
            .map(|s| s.key().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Current listener port for `peer_id`
    pub fn port(&self, peer_id: &PeerId) -> Option<u16> {
        self.current(peer_id).map(|g| g.port)
    }

    /// Current generation number for `peer_id`
    pub fn generation(&self, peer_id: &PeerId) -> Option<u64> {
        self.current(peer_id).map(|g| g.number)
    }

    /// Session of the current generation for `peer_id`
    pub fn session(&self, peer_id: &PeerId) -> Option<MuxSession> {
        self.current(peer_id).map(|g| g.session.clone())
    }

    fn current(&self, peer_id: &PeerId) -> Option<Arc<Generation>> {
        self.inner
            .peers
            .get(peer_id)
            .and_then(|slot| slot.current())
    }

    fn ensure_started(&self) -> Result<(), BridgeError> {
        if self.inner.closing.is_cancelled() {
            return Err(BridgeError::Stopped);
        }
        match self.inner.incoming.state() {
            BridgeState::Started => Ok(()),
            BridgeState::Created | BridgeState::Starting => Err(BridgeError::NotStarted),
            BridgeState::Stopping | BridgeState::Stopped => Err(BridgeError::Stopped),
        }
    }

    /// Existing live slot for the peer, or a freshly spawned one
    async fn slot_for(&self, peer_id: &PeerId) -> Arc<PeerSlot> {
        loop {
            let existing = self.inner.peers.get(peer_id).map(|s| Arc::clone(s.value()));
            if let Some(slot) = existing {
                if !slot.stop.is_cancelled() {
                    return slot;
                }
                // Being removed; start over once it is gone
                slot.finished.cancelled().await;
                continue;
            }

            self.make_room(peer_id).await;

            let slot = Arc::new(PeerSlot::new(peer_id.clone()));
            match self.inner.peers.entry(peer_id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::clone(&slot));
                }
            }

            tracing::debug!("Creating peer session for {}", peer_id);
            tokio::spawn(supervisor::supervise(
                Arc::clone(&self.inner),
                Arc::clone(&slot),
            ));
            if self.inner.closing.is_cancelled() {
                slot.stop.cancel();
            }
            return slot;
        }
    }

    /// Evict least-recently-active peers until a new one fits
    async fn make_room(&self, incoming_peer: &PeerId) {
        let max = self.inner.config.max_peer_listeners;
        loop {
            let live: Vec<Arc<PeerSlot>> = self
                .inner
                .peers
                .iter()
                .filter(|s| !s.stop.is_cancelled())
                .map(|s| Arc::clone(s.value()))
                .collect();
            if live.len() < max {
                return;
            }

            let Some(victim) = live.into_iter().min_by_key(|s| s.last_activity()) else {
                return;
            };
            tracing::info!(
                "Evicting least recently active peer {} to make room for {}",
                victim.peer_id,
                incoming_peer
            );
            victim.shut_down().await;
        }
    }
}

impl OutgoingInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl std::fmt::Debug for OutgoingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingBridge")
            .field("peers", &self.peers())
            .finish()
    }
}
