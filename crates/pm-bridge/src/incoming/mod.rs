//! Incoming bridge
//!
//! Owns the relay listener that native-relayed links connect to. Every
//! accepted socket becomes an [`IncomingConnection`] with its own session, and
//! every stream the remote opens on it is piped to a fresh connection
//! against the application server.

mod connection;

pub use connection::IncomingConnection;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pm_core::config::BridgeConfig;
use pm_core::{BridgeError, BridgeState, IncomingConnectionId};

use crate::mux::MuxSession;
use crate::pipe::ApplicationTarget;
use crate::registry::{ConnectionKey, ConnectionRegistry};

/// State shared with the accept loop and connection tasks
pub(crate) struct IncomingInner {
    config: Arc<BridgeConfig>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) connections: DashMap<IncomingConnectionId, Arc<IncomingConnection>>,
    next_id: AtomicU64,
    /// Relay port while started, 0 otherwise
    relay_port: AtomicU16,
    application_port: AtomicU16,
    /// Woken on every accept, for reverse claims
    accepted: Notify,
}

impl IncomingInner {
    fn admit(self: &Arc<Self>, socket: TcpStream, remote_addr: SocketAddr, target: &ApplicationTarget) {
        let _ = socket.set_nodelay(true);

        let id = IncomingConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (session, acceptor) =
            MuxSession::open(socket, id.to_string(), self.config.incoming_mux());
        let conn = Arc::new(IncomingConnection::new(id, remote_addr, session));

        self.connections.insert(id, Arc::clone(&conn));
        self.registry.mark_connected(ConnectionKey::Incoming(id));
        self.accepted.notify_waiters();

        tracing::info!("Accepted {} from {}", id, remote_addr);
        tokio::spawn(connection::serve(
            Arc::clone(self),
            conn,
            acceptor,
            target.clone(),
        ));
    }

    /// Most recently accepted unclaimed live connection from `client_port`
    fn claim(&self, client_port: u16) -> Option<Arc<IncomingConnection>> {
        let mut candidates: Vec<Arc<IncomingConnection>> = self
            .connections
            .iter()
            .filter(|c| c.remote_addr().port() == client_port && !c.is_claimed())
            .map(|c| Arc::clone(c.value()))
            .collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.id()));

        candidates.into_iter().find(|c| c.try_claim())
    }

    async fn terminate_all(&self) {
        let all: Vec<Arc<IncomingConnection>> = self
            .connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();

        futures::future::join_all(all.iter().map(|c| c.terminate())).await;
    }
}

/// Listener lifecycle guarded by the bridge mutex
#[derive(Default)]
struct Lifecycle {
    relay_port: u16,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<TcpListener>>,
}

/// Relay listener plus every connection accepted on it
pub struct IncomingBridge {
    inner: Arc<IncomingInner>,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<BridgeState>,
}

impl IncomingBridge {
    pub fn new(config: Arc<BridgeConfig>, registry: Arc<ConnectionRegistry>) -> Self {
        let (state, _) = watch::channel(BridgeState::Created);
        Self {
            inner: Arc::new(IncomingInner {
                config,
                registry,
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                relay_port: AtomicU16::new(0),
                application_port: AtomicU16::new(0),
                accepted: Notify::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            state,
        }
    }

    /// Open the relay listener and route remote streams to `application_port`
    ///
    /// Returns the relay port. A second call while started returns the same
    /// port.
    pub async fn start(&self, application_port: u16) -> Result<u16, BridgeError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let current = *self.state.borrow();
        match current {
            BridgeState::Started => return Ok(lifecycle.relay_port),
            BridgeState::Stopping | BridgeState::Stopped => return Err(BridgeError::Stopped),
            BridgeState::Created | BridgeState::Starting => {}
        }
        self.state.send_replace(BridgeState::Starting);

        let bound = async {
            let listener = TcpListener::bind((
                self.inner.config.bind_host.as_str(),
                self.inner.config.relay_port,
            ))
            .await?;
            let port = listener.local_addr()?.port();
            Ok::<_, std::io::Error>((listener, port))
        }
        .await;

        let (listener, relay_port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.state.send_replace(BridgeState::Created);
                return Err(e.into());
            }
        };

        let target = ApplicationTarget {
            host: Arc::from(self.inner.config.bind_host.as_str()),
            port: application_port,
            connect_timeout: self.inner.config.connect_timeout,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            target,
            cancel.clone(),
        ));

        *lifecycle = Lifecycle {
            relay_port,
            cancel,
            accept_task: Some(task),
        };
        self.inner.relay_port.store(relay_port, Ordering::SeqCst);
        self.inner
            .application_port
            .store(application_port, Ordering::SeqCst);
        self.state.send_replace(BridgeState::Started);

        tracing::info!(
            "Relay listening on {}:{} for application port {}",
            self.inner.config.bind_host,
            relay_port,
            application_port
        );
        Ok(relay_port)
    }

    /// Stop accepting and tear down every connection
    ///
    /// Idempotent once started.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let current = *self.state.borrow();
        match current {
            BridgeState::Created | BridgeState::Starting => return Err(BridgeError::NotStarted),
            BridgeState::Stopped => return Ok(()),
            BridgeState::Started | BridgeState::Stopping => {}
        }
        self.state.send_replace(BridgeState::Stopping);

        lifecycle.cancel.cancel();
        let listener = match lifecycle.accept_task.take() {
            Some(task) => task.await.ok(),
            None => None,
        };

        self.inner.terminate_all().await;
        drop(listener);
        self.inner.relay_port.store(0, Ordering::SeqCst);
        self.inner.application_port.store(0, Ordering::SeqCst);

        self.state.send_replace(BridgeState::Stopped);
        tracing::info!("Relay on port {} stopped", lifecycle.relay_port);
        Ok(())
    }

    /// Tear down one connection and wait for it; unknown ids are a no-op
    pub async fn terminate_incoming_connection(&self, id: IncomingConnectionId) {
        let conn = self.inner.connections.get(&id).map(|c| Arc::clone(c.value()));
        if let Some(conn) = conn {
            conn.terminate().await;
        }
    }

    /// Take the session of a relay socket a reverse native link created
    ///
    /// `server_port` must be this relay. Waits up to `wait` for a matching
    /// socket to be accepted.
    pub async fn claim_reverse(
        &self,
        client_port: u16,
        server_port: u16,
        wait: Duration,
    ) -> Result<MuxSession, BridgeError> {
        match self.state() {
            BridgeState::Started => {}
            BridgeState::Created | BridgeState::Starting => return Err(BridgeError::NotStarted),
            BridgeState::Stopping | BridgeState::Stopped => return Err(BridgeError::Stopped),
        }
        let relay_port = self.inner.relay_port.load(Ordering::SeqCst);
        if server_port != relay_port {
            return Err(BridgeError::MismatchedServerPort {
                expected: relay_port,
                actual: server_port,
            });
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.accepted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.inner.claim(client_port) {
                tracing::debug!("Reverse link from port {} uses {}", client_port, conn.id());
                return Ok(conn.session().clone());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BridgeError::ReverseConnectionMissing { client_port });
            }
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Relay port while started
    pub fn relay_port(&self) -> Option<u16> {
        match self.inner.relay_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    /// Application port while started
    pub fn application_port(&self) -> Option<u16> {
        match self.inner.application_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    /// Where remote-opened streams are delivered while started
    pub(crate) fn application_target(&self) -> Option<ApplicationTarget> {
        self.application_port().map(|port| ApplicationTarget {
            host: Arc::from(self.inner.config.bind_host.as_str()),
            port,
            connect_timeout: self.inner.config.connect_timeout,
        })
    }

    pub fn connection(&self, id: IncomingConnectionId) -> Option<Arc<IncomingConnection>> {
        self.inner.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn connection_ids(&self) -> Vec<IncomingConnectionId> {
        let mut ids: Vec<_> = self.inner.connections.iter().map(|c| *c.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Application pipes across all connections
    pub fn pipe_count(&self) -> usize {
        self.inner
            .connections
            .iter()
            .map(|c| c.pipe_count())
            .sum()
    }
}

async fn accept_loop(
    inner: Arc<IncomingInner>,
    listener: TcpListener,
    target: ApplicationTarget,
    cancel: CancellationToken,
) -> TcpListener {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Relay accept loop shutting down");
                break;
            }
            result = listener.accept() => match result {
                Ok((socket, remote_addr)) => inner.admit(socket, remote_addr, &target),
                Err(e) => {
                    tracing::error!("Failed to accept relay connection: {}", e);
                }
            }
        }
    }
    listener
}

impl std::fmt::Debug for IncomingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingBridge")
            .field("state", &self.state())
            .field("connections", &self.len())
            .finish()
    }
}

