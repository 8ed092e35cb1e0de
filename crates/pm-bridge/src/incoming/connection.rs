//! One accepted relay connection and its teardown path

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pm_core::IncomingConnectionId;

use crate::mux::{IncomingStreams, MuxSession};
use crate::pipe::{route_to_application, ApplicationTarget};
use crate::registry::ConnectionKey;

use super::IncomingInner;

/// A socket accepted on the relay listener plus the session over it
pub struct IncomingConnection {
    id: IncomingConnectionId,
    remote_addr: SocketAddr,
    session: MuxSession,
    /// Taken by a reverse peer session
    claimed: AtomicBool,
    /// Active application pipes
    pipes: AtomicUsize,
    /// Requests teardown
    cancel: CancellationToken,
    /// Cancelled once teardown has completed
    finished: CancellationToken,
}

impl IncomingConnection {
    pub(crate) fn new(id: IncomingConnectionId, remote_addr: SocketAddr, session: MuxSession) -> Self {
        Self {
            id,
            remote_addr,
            session,
            claimed: AtomicBool::new(false),
            pipes: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> IncomingConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn session(&self) -> &MuxSession {
        &self.session
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes.load(Ordering::SeqCst)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Mark this connection as used by a reverse peer session
    ///
    /// Succeeds at most once.
    pub(crate) fn try_claim(&self) -> bool {
        !self.session.is_closed()
            && self
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Request teardown and wait for it to finish
    pub(crate) async fn terminate(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }
}

/// Route remote streams until the connection ends, then tear everything down
pub(crate) async fn serve(
    inner: Arc<IncomingInner>,
    conn: Arc<IncomingConnection>,
    mut acceptor: IncomingStreams,
    target: ApplicationTarget,
) {
    let mut pipes = JoinSet::new();
    let pipe_cancel = CancellationToken::new();

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => {
                tracing::debug!("Terminating {}", conn.id);
                break;
            }
            end = conn.session.closed() => {
                tracing::info!("Connection {} from {} closed: {}", conn.id, conn.remote_addr, end);
                break;
            }
            stream = acceptor.accept() => match stream {
                Some(stream) => {
                    conn.pipes.fetch_add(1, Ordering::SeqCst);
                    let conn = Arc::clone(&conn);
                    let registry = Arc::clone(&inner.registry);
                    let target = target.clone();
                    let cancel = pipe_cancel.clone();
                    pipes.spawn(async move {
                        route_to_application(stream, target, registry, cancel).await;
                        conn.pipes.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                None => {
                    tracing::debug!("Connection {} stopped surfacing streams", conn.id);
                    break;
                }
            },
            Some(_) = pipes.join_next(), if !pipes.is_empty() => {}
        }
    }

    tracing::debug!(
        "Tearing down {} with {} pipes and {} open streams",
        conn.id,
        pipes.len(),
        conn.session.stream_count()
    );

    // Pipes first, then the session and socket, then bookkeeping
    pipe_cancel.cancel();
    while pipes.join_next().await.is_some() {}

    conn.session.destroy();
    conn.session.closed().await;

    inner.connections.remove(&conn.id);
    inner
        .registry
        .mark_disconnected(&ConnectionKey::Incoming(conn.id));
    conn.finished.cancel();
}
