//! Logical stream handle

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use pm_protocol::{Frame, Message, StreamId};

use super::session::Shared;

/// One logical byte stream inside a [`MuxSession`](super::MuxSession)
///
/// `shutdown` half-closes the write side. Dropping a stream that has not
/// been closed in both directions resets it on the remote end.
pub struct MuxStream {
    id: StreamId,
    shared: Arc<Shared>,
    data_rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    reset: Arc<AtomicBool>,
    frames: PollSender<Frame>,
    read_eof: bool,
    write_closed: bool,
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

impl MuxStream {
    pub(crate) fn new(
        id: StreamId,
        shared: Arc<Shared>,
        data_rx: mpsc::Receiver<Bytes>,
        reset: Arc<AtomicBool>,
    ) -> Self {
        let frames = PollSender::new(shared.frames_tx.clone());
        Self {
            id,
            shared,
            data_rx,
            pending: Bytes::new(),
            reset,
            frames,
            read_eof: false,
            write_closed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    fn is_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst) || self.shared.shutdown.is_cancelled()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.reset.load(Ordering::SeqCst) {
                return Poll::Ready(Err(reset_error()));
            }

            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.data_rx.poll_recv(cx)) {
                Some(bytes) => this.pending = bytes,
                None => {
                    // Slot dropped: either a clean Close or a reset
                    if this.reset.load(Ordering::SeqCst) {
                        return Poll::Ready(Err(reset_error()));
                    }
                    this.read_eof = true;
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        if this.write_closed {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.frames.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        let n = buf.len().min(this.shared.config.max_frame_payload);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        this.frames
            .send_item(Frame::new(this.id, Message::Data(chunk)))
            .map_err(|_| broken_pipe())?;

        tracing::trace!("{} queued {} bytes", this.id, n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        if this.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }

        ready!(this.frames.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        this.frames
            .send_item(Frame::new(this.id, Message::Close))
            .map_err(|_| broken_pipe())?;
        this.write_closed = true;

        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.streams.remove(&self.id);

        if self.is_reset() || (self.write_closed && self.read_eof) {
            return;
        }
        self.frames.abort_send();
        self.shared.send_reset(self.id);
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("session", &self.shared.label)
            .field("read_eof", &self.read_eof)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}
