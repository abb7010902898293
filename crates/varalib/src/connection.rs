//! One logical radio link, as seen by the application.
//!
//! A [`Connection`] is handed out by [`Server::accept`](crate::Server::accept)
//! after the modem reports `CONNECTED`. It is a handle: the data socket and
//! the link's bookkeeping ([`Link`]) live in the session task, and the two
//! sides talk over channels.
//!
//! - Writes go to the session as [`LinkRequest::Write`] and are forwarded
//!   verbatim to the data socket by its writer task. Each completed write
//!   adds to the link's `buffer_length`; the modem's `BUFFER <n>` reports
//!   replace it.
//! - Received data arrives as [`ConnectionEvent::Data`]. Taking an event
//!   off the handle is what signals readiness for more: once the unread
//!   bytes reach the high-water mark, the next chunk is reported as
//!   [`Error::ReceiveBufferOverflow`] instead of being queued.
//! - [`Connection::end`] closes the write direction. While the modem still
//!   holds unsent bytes the link drains; the data socket is closed once the
//!   modem reports `BUFFER 0`.
//! - However a link ends (local destroy, remote `DISCONNECTED`, data socket
//!   closing), the handle sees [`ConnectionEvent::End`] and then
//!   [`ConnectionEvent::Close`] exactly once each.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch};

use varalib_core::error::{Error, Result};
use varalib_core::types::ConnectionState;
use varalib_protocol::summarize;

/// Something that happened on a [`Connection`], in order of occurrence.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Bytes received from the remote station.
    Data(Bytes),
    /// A socket error or a receive-buffer overflow. Not terminal by itself.
    Error(Error),
    /// No more data will be received.
    End,
    /// The link is gone. Last event.
    Close,
}

/// Requests from a [`Connection`] handle to the session task.
#[derive(Debug)]
pub(crate) enum LinkRequest {
    Write {
        id: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    End {
        id: u64,
    },
    Destroy {
        id: u64,
    },
}

/// A bidirectional byte stream over one radio link.
///
/// Besides the event API ([`next_event`](Connection::next_event),
/// [`read`](Connection::read), [`write`](Connection::write)) a connection
/// implements [`AsyncRead`] and [`AsyncWrite`], so it works with
/// `tokio::io::copy`, `BufReader` and framed codecs. `poll_shutdown` is
/// [`end`](Connection::end); an error event surfaces from `poll_read` as an
/// `io::Error`, and the stream reads EOF once the link has ended.
///
/// Dropping a handle without calling [`end`](Connection::end) or
/// [`destroy`](Connection::destroy) ends it gracefully.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    remote: String,
    local: String,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    queued: Arc<AtomicUsize>,
    state: watch::Receiver<ConnectionState>,
    requests: mpsc::UnboundedSender<LinkRequest>,
    /// Rest of a data chunk partly consumed by `poll_read`.
    read_chunk: Option<Bytes>,
    /// Completion of the last write accepted by `poll_write`.
    pending_write: Option<oneshot::Receiver<Result<()>>>,
    output_ended: bool,
    finished: bool,
}

impl Connection {
    /// Call sign of the station that connected.
    pub fn remote_call_sign(&self) -> &str {
        &self.remote
    }

    /// Which of our call signs it connected to.
    pub fn local_call_sign(&self) -> &str {
        &self.local
    }

    /// Link identifier, unique within one control session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Next event, or `None` once [`ConnectionEvent::Close`] has been taken.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<ConnectionEvent>> {
        if let Some(chunk) = self.read_chunk.take() {
            return Poll::Ready(Some(ConnectionEvent::Data(chunk)));
        }
        if self.finished {
            return Poll::Ready(None);
        }
        let event = ready!(self.events.poll_recv(cx));
        match &event {
            Some(ConnectionEvent::Data(data)) => {
                self.queued.fetch_sub(data.len(), Ordering::AcqRel);
            }
            Some(ConnectionEvent::Close) | None => self.finished = true,
            _ => {}
        }
        Poll::Ready(event)
    }

    /// Next chunk of received data.
    ///
    /// Returns `Ok(None)` at end of stream and `Err` for an error event;
    /// reading may continue after an error.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        match self.next_event().await {
            Some(ConnectionEvent::Data(data)) => Ok(Some(data)),
            Some(ConnectionEvent::Error(e)) => Err(e),
            Some(ConnectionEvent::End) | Some(ConnectionEvent::Close) | None => Ok(None),
        }
    }

    /// Send bytes to the remote station.
    ///
    /// Resolves once the bytes are written to the data socket. Writes after
    /// [`end`](Connection::end), or after the link is already gone, are
    /// dropped and succeed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.output_ended {
            tracing::debug!(id = self.id, data = %summarize(data), "write after end dropped");
            return Ok(());
        }
        std::future::poll_fn(|cx| self.poll_pending_write(cx)).await?;
        self.submit_write(data).await.unwrap_or(Ok(()))
    }

    /// Finish writing. The link closes once the modem has transmitted
    /// everything it buffered.
    pub async fn end(&mut self) {
        self.send_end();
    }

    /// Tear the link down now, asking the modem to disconnect.
    pub async fn destroy(&mut self) {
        self.output_ended = true;
        self.send(LinkRequest::Destroy { id: self.id });
    }

    /// Wait until the link is disconnected.
    pub async fn closed(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    fn send_end(&mut self) {
        if !self.output_ended {
            self.output_ended = true;
            self.send(LinkRequest::End { id: self.id });
        }
    }

    fn send(&self, request: LinkRequest) {
        if self.requests.send(request).is_err() {
            tracing::trace!(id = self.id, "session gone, link request dropped");
        }
    }

    /// Hand `data` to the session. The receiver resolves when the write
    /// completes; a dropped sender means the link is gone.
    fn submit_write(&self, data: &[u8]) -> oneshot::Receiver<Result<()>> {
        let (reply, done) = oneshot::channel();
        self.send(LinkRequest::Write {
            id: self.id,
            data: Bytes::copy_from_slice(data),
            reply,
        });
        done
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(done) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(done).poll(cx));
        self.pending_write = None;
        Poll::Ready(result.unwrap_or(Ok(())))
    }
}

fn into_io_error(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        e @ (Error::ConnectionLost | Error::NotConnected) => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        e => io::Error::other(e),
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match ready!(self.poll_event(cx)) {
                Some(ConnectionEvent::Data(mut chunk)) => {
                    let n = chunk.len().min(buf.remaining());
                    buf.put_slice(&chunk[..n]);
                    chunk.advance(n);
                    if !chunk.is_empty() {
                        self.read_chunk = Some(chunk);
                    }
                    if n > 0 {
                        return Poll::Ready(Ok(()));
                    }
                }
                Some(ConnectionEvent::Error(e)) => return Poll::Ready(Err(into_io_error(e))),
                // End and Close both read as EOF.
                Some(ConnectionEvent::End) | Some(ConnectionEvent::Close) | None => {
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.output_ended {
            return Poll::Ready(Ok(data.len()));
        }
        // One write in flight at a time.
        ready!(self.poll_pending_write(cx)).map_err(into_io_error)?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let done = self.submit_write(data);
        self.pending_write = Some(done);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_pending_write(cx).map_err(into_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_pending_write(cx)).map_err(into_io_error)?;
        self.send_end();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.send_end();
    }
}

// ---------------------------------------------------------------------------
// Session side
// ---------------------------------------------------------------------------

/// The session task's half of a link.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) id: u64,
    pub(crate) remote: String,
    pub(crate) local: String,
    /// Bytes the modem may still hold for transmission.
    pub(crate) buffer_length: u64,
    /// Writes handed to the data socket writer and not yet completed.
    pub(crate) writes_in_flight: usize,
    pub(crate) output_ended: bool,
    ended: bool,
    closed: bool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    queued: Arc<AtomicUsize>,
    high_water: usize,
    state: watch::Sender<ConnectionState>,
}

impl Link {
    /// Create a connected link and the handle the application gets.
    pub(crate) fn new(
        id: u64,
        remote: String,
        local: String,
        high_water: usize,
        requests: mpsc::UnboundedSender<LinkRequest>,
    ) -> (Link, Connection) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let queued = Arc::new(AtomicUsize::new(0));

        let connection = Connection {
            id,
            remote: remote.clone(),
            local: local.clone(),
            events: event_rx,
            queued: queued.clone(),
            state: state_rx,
            requests,
            read_chunk: None,
            pending_write: None,
            output_ended: false,
            finished: false,
        };
        let link = Link {
            id,
            remote,
            local,
            buffer_length: 0,
            writes_in_flight: 0,
            output_ended: false,
            ended: false,
            closed: false,
            events: event_tx,
            queued,
            high_water,
            state: state_tx,
        };
        (link, connection)
    }

    /// Queue received bytes for the consumer.
    ///
    /// Fails when the consumer has left `high_water` bytes or more unread;
    /// the chunk is not queued.
    pub(crate) fn push_data(&self, data: Bytes) -> Result<()> {
        let unread = self.queued.load(Ordering::Acquire);
        if unread >= self.high_water {
            return Err(Error::ReceiveBufferOverflow(summarize(&data)));
        }
        self.queued.fetch_add(data.len(), Ordering::AcqRel);
        let _ = self.events.send(ConnectionEvent::Data(data));
        Ok(())
    }

    /// Deliver an error to the consumer.
    pub(crate) fn error(&self, err: Error) {
        if !self.closed {
            let _ = self.events.send(ConnectionEvent::Error(err));
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Emit `End` and `Close` if not already emitted.
    pub(crate) fn teardown(&mut self) {
        if !self.ended {
            self.ended = true;
            let _ = self.events.send(ConnectionEvent::End);
        }
        if !self.closed {
            self.closed = true;
            self.set_state(ConnectionState::Disconnected);
            let _ = self.events.send(ConnectionEvent::Close);
        }
    }
}
