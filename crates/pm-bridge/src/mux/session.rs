//! Session task and shared stream table

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use pm_core::config::MuxConfig;
use pm_core::time::{elapsed_duration, monotonic_millis};
use pm_core::MuxError;
use pm_protocol::{Frame, FrameCodec, Message, StreamId, StreamOrigin, MAX_STREAM_INDEX};

use super::stream::MuxStream;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The underlying connection reached end of file
    RemoteClosed,
    /// `destroy` was called
    Destroyed,
    /// No frame crossed the connection within the idle timeout
    IdleTimeout,
    /// Transport or protocol error
    Failed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::RemoteClosed => write!(f, "remote closed"),
            SessionEnd::Destroyed => write!(f, "destroyed"),
            SessionEnd::IdleTimeout => write!(f, "idle timeout"),
            SessionEnd::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-stream routing entry owned by the session
pub(crate) struct StreamSlot {
    /// Delivers inbound data; dropped on `Close`
    data_tx: Option<mpsc::Sender<Bytes>>,
    /// Set when the stream is reset or the session ends
    reset: Arc<AtomicBool>,
}

/// State shared by the session task, its handles and its streams
pub(crate) struct Shared {
    pub(crate) label: String,
    pub(crate) config: MuxConfig,
    pub(crate) streams: DashMap<StreamId, StreamSlot>,
    next_local: AtomicU32,
    pub(crate) frames_tx: mpsc::Sender<Frame>,
    resets_tx: mpsc::UnboundedSender<StreamId>,
    pub(crate) shutdown: CancellationToken,
    finished: CancellationToken,
    end: watch::Sender<Option<SessionEnd>>,
    last_activity: AtomicU64,
}

impl Shared {
    fn touch(&self) {
        self.last_activity
            .store(monotonic_millis(), Ordering::Relaxed);
    }

    /// Register a stream and build its handle
    fn attach(self: &Arc<Self>, id: StreamId) -> MuxStream {
        let (data_tx, data_rx) = mpsc::channel(self.config.stream_buffer);
        let reset = Arc::new(AtomicBool::new(false));
        self.streams.insert(
            id,
            StreamSlot {
                data_tx: Some(data_tx),
                reset: Arc::clone(&reset),
            },
        );
        MuxStream::new(id, Arc::clone(self), data_rx, reset)
    }

    /// Queue a `Reset` for a stream whose handle went away early
    pub(crate) fn send_reset(&self, id: StreamId) {
        // Keep order behind queued data when there is room
        if self
            .frames_tx
            .try_send(Frame::new(id, Message::Reset))
            .is_err()
        {
            let _ = self.resets_tx.send(id);
        }
    }

    /// End the session: record why, stop both loops and invalidate every stream
    fn terminate(&self, end: SessionEnd) {
        self.end.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(end);
                true
            } else {
                false
            }
        });
        self.shutdown.cancel();

        for slot in self.streams.iter() {
            slot.reset.store(true, Ordering::SeqCst);
        }
        self.streams.clear();
    }

    fn end_reason(&self) -> SessionEnd {
        self.end.borrow().clone().unwrap_or(SessionEnd::Destroyed)
    }

    fn remaining_idle(&self) -> Option<Duration> {
        self.config.idle_timeout.map(|timeout| {
            timeout.saturating_sub(elapsed_duration(
                self.last_activity.load(Ordering::Relaxed),
            ))
        })
    }
}

/// Handle to a multiplexed session
///
/// Cloning is cheap; all clones refer to the same session. The session keeps
/// running until the connection ends or [`MuxSession::destroy`] is called.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
}

/// Receives streams opened by the remote end
pub struct IncomingStreams {
    rx: mpsc::Receiver<MuxStream>,
}

impl IncomingStreams {
    /// Next remotely opened stream, or `None` once the session has ended
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await
    }
}

impl MuxSession {
    /// Start a session over `io`
    ///
    /// Spawns the session task; must be called within a Tokio runtime.
    pub fn open<T>(io: T, label: impl Into<String>, config: MuxConfig) -> (MuxSession, IncomingStreams)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::channel(config.outbound_buffer);
        let (resets_tx, resets_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.stream_buffer);
        let (end, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            label: label.into(),
            config,
            streams: DashMap::new(),
            next_local: AtomicU32::new(1), // 0 is reserved
            frames_tx,
            resets_tx,
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            end,
            last_activity: AtomicU64::new(monotonic_millis()),
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(io);
            let reader = FramedRead::new(read_half, FrameCodec::new());
            let writer = FramedWrite::new(write_half, FrameCodec::new());

            let end = tokio::select! {
                end = read_loop(&task_shared, reader, incoming_tx) => end,
                end = write_loop(&task_shared, writer, frames_rx, resets_rx) => end,
            };

            tracing::debug!("Session {} ended: {}", task_shared.label, end);
            task_shared.terminate(end);
            task_shared.finished.cancel();
        });

        (
            MuxSession { shared },
            IncomingStreams { rx: incoming_rx },
        )
    }

    /// Open a new stream; the remote surfaces it through its acceptor
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }

        let index = self.shared.next_local.fetch_add(1, Ordering::SeqCst);
        if index > MAX_STREAM_INDEX {
            return Err(MuxError::StreamIdsExhausted);
        }

        let id = StreamId::local(index);
        let stream = self.shared.attach(id);

        // terminate() may have cleared the table just before the insert
        if self.shared.shutdown.is_cancelled() {
            self.shared.streams.remove(&id);
            return Err(self.closed_error());
        }

        self.shared
            .frames_tx
            .send(Frame::new(id, Message::Open))
            .await
            .map_err(|_| self.closed_error())?;

        tracing::debug!("Session {} opened {}", self.shared.label, id);
        Ok(stream)
    }

    /// Invalidate every stream and release the underlying connection
    ///
    /// Idempotent. Use [`MuxSession::closed`] to wait for the release.
    pub fn destroy(&self) {
        self.shared.terminate(SessionEnd::Destroyed);
    }

    /// Whether the session has ended or is ending
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Wait until the session task has exited and the connection is dropped
    pub async fn closed(&self) -> SessionEnd {
        self.shared.finished.cancelled().await;
        self.shared.end_reason()
    }

    /// Number of streams currently registered
    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }

    /// Monotonic millisecond stamp of the last frame read or written
    pub fn last_activity_millis(&self) -> u64 {
        self.shared.last_activity.load(Ordering::Relaxed)
    }

    fn closed_error(&self) -> MuxError {
        let reason = self
            .shared
            .end
            .borrow()
            .as_ref()
            .map(|end| end.to_string())
            .unwrap_or_else(|| "closing".to_string());
        MuxError::SessionClosed(reason)
    }
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSession")
            .field("label", &self.shared.label)
            .field("streams", &self.shared.streams.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn idle_expired(remaining: Option<Duration>) {
    match remaining {
        Some(remaining) => tokio::time::sleep(remaining).await,
        None => std::future::pending().await,
    }
}

async fn read_loop<R>(
    shared: &Arc<Shared>,
    mut reader: FramedRead<R, FrameCodec>,
    incoming_tx: mpsc::Sender<MuxStream>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let remaining = shared.remaining_idle();
        if remaining == Some(Duration::ZERO) {
            return SessionEnd::IdleTimeout;
        }

        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => return SessionEnd::Destroyed,
            _ = idle_expired(remaining) => continue,
            next = reader.next() => next,
        };

        let frame = match next {
            None => return SessionEnd::RemoteClosed,
            Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
            Some(Ok(frame)) => frame,
        };
        shared.touch();

        let id = frame.stream_id;
        match frame.message {
            Message::Open => {
                if id.origin() != StreamOrigin::Remote || shared.streams.contains_key(&id) {
                    tracing::warn!("Session {} ignoring bad open for {}", shared.label, id);
                    continue;
                }
                let stream = shared.attach(id);
                tracing::debug!("Session {} accepted {}", shared.label, id);

                tokio::select! {
                    _ = shared.shutdown.cancelled() => return SessionEnd::Destroyed,
                    sent = incoming_tx.send(stream) => {
                        // A dropped acceptor drops the stream, which resets it
                        if sent.is_err() {
                            tracing::debug!("Session {} has no acceptor for {}", shared.label, id);
                        }
                    }
                }
            }
            Message::Data(bytes) => {
                let data_tx = shared
                    .streams
                    .get(&id)
                    .and_then(|slot| slot.data_tx.clone());
                let Some(data_tx) = data_tx else {
                    tracing::trace!("Session {} dropped {} bytes for {}", shared.label, bytes.len(), id);
                    continue;
                };

                tokio::select! {
                    _ = shared.shutdown.cancelled() => return SessionEnd::Destroyed,
                    _ = data_tx.send(bytes) => {}
                }
            }
            Message::Close => {
                if let Some(mut slot) = shared.streams.get_mut(&id) {
                    slot.data_tx = None;
                }
            }
            Message::Reset => {
                if let Some((_, slot)) = shared.streams.remove(&id) {
                    slot.reset.store(true, Ordering::SeqCst);
                    tracing::debug!("Session {} peer reset {}", shared.label, id);
                }
            }
        }
    }
}

async fn write_loop<W>(
    shared: &Arc<Shared>,
    mut writer: FramedWrite<W, FrameCodec>,
    mut frames_rx: mpsc::Receiver<Frame>,
    mut resets_rx: mpsc::UnboundedReceiver<StreamId>,
) -> SessionEnd
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return SessionEnd::Destroyed,
            Some(id) = resets_rx.recv() => Frame::new(id, Message::Reset),
            Some(frame) = frames_rx.recv() => frame,
            else => return SessionEnd::Destroyed,
        };

        let written = tokio::select! {
            _ = shared.shutdown.cancelled() => return SessionEnd::Destroyed,
            written = write_batch(&mut writer, frame, &mut frames_rx) => written,
        };

        if let Err(e) = written {
            return SessionEnd::Failed(e.to_string());
        }
        shared.touch();
    }
}

/// Write one frame plus whatever is already queued, then flush once
async fn write_batch<W>(
    writer: &mut FramedWrite<W, FrameCodec>,
    first: Frame,
    frames_rx: &mut mpsc::Receiver<Frame>,
) -> Result<(), pm_protocol::ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.feed(first).await?;
    while let Ok(frame) = frames_rx.try_recv() {
        writer.feed(frame).await?;
    }
    writer.flush().await
}
