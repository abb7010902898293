//! The session task: control channel, data channel and link state.
//!
//! One tokio task per listening [`Server`](crate::Server) owns every socket
//! and all protocol state. Its outer loop (re)connects the control socket;
//! each successful connect runs a [`ControlSession`] until the socket drops,
//! the modem reports `MISSING`, or the server is closed.
//!
//! A control session multiplexes with `tokio::select! { biased; }`:
//! 1. Cancellation (`Server::close`)
//! 2. Control-channel bytes, decoded into lines and dispatched
//! 3. Requests from the active [`Connection`] (write / end / destroy)
//! 4. Completed data writes
//! 5. Data-channel bytes, pushed into the active link
//!
//! Since nothing else touches this state, no locks are needed, and the
//! command queue's ordering follows from the loop running one step at a
//! time. No handler awaits the data socket: its write half belongs to a
//! small writer task, so a modem that stops reading the data port never
//! holds up control lines or cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, trace, warn};

use varalib_core::error::{Error, Result};
use varalib_core::events::{ListeningInfo, ServerEvent};
use varalib_core::transport::{BoxedStream, Connector};
use varalib_core::types::ConnectionState;
use varalib_protocol::{Command, CommandQueue, LineCodec, Notice, ProtocolLine, summarize};

use crate::config::SessionConfig;
use crate::connection::{Connection, Link, LinkRequest};

/// Initial read buffer capacity for both sockets.
const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Handle to a running session task. Stored inside the server.
pub(crate) struct SessionHandle {
    pub(crate) cancel: CancellationToken,
    /// Cleared by `close()` and by the task itself when it stops.
    pub(crate) active: Arc<AtomicBool>,
    /// Taken by the first `Server::closed()` call.
    pub(crate) task: Option<JoinHandle<()>>,
}

/// Everything the session task needs that outlives one control connection.
struct SessionContext {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    event_tx: broadcast::Sender<ServerEvent>,
    accept_tx: mpsc::UnboundedSender<Connection>,
    cancel: CancellationToken,
}

impl SessionContext {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_error(&self, err: Error) {
        self.emit(ServerEvent::Error(Arc::new(err)));
    }

    fn listening_info(&self) -> ListeningInfo {
        ListeningInfo {
            my_call_signs: self.config.my_call_signs.clone(),
            host: self.config.host.clone(),
            control_port: self.config.control_port,
            data_port: self.config.data_port,
            kind: self.config.kind,
        }
    }

    /// Open a socket, giving up after the configured connect timeout.
    async fn connect(&self, port: u16) -> Result<BoxedStream> {
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config.host, port),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(port, "connect timed out");
                Err(Error::Timeout)
            }
        }
    }
}

/// Spawn the session task for one `listen()` call.
pub(crate) fn spawn_session(
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    event_tx: broadcast::Sender<ServerEvent>,
    accept_tx: mpsc::UnboundedSender<Connection>,
) -> SessionHandle {
    let cancel = CancellationToken::new();
    let active = Arc::new(AtomicBool::new(true));
    let span = tracing::info_span!(
        "vara",
        host = %config.host,
        port = config.control_port,
        kind = %config.kind
    );

    let ctx = SessionContext {
        connector,
        config,
        event_tx,
        accept_tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(session_loop(ctx, active.clone()).instrument(span));

    SessionHandle {
        cancel,
        active,
        task: Some(task),
    }
}

// ---------------------------------------------------------------------------
// Reconnect loop
// ---------------------------------------------------------------------------

/// How a control session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The server was closed locally.
    Closed,
    /// The modem reported `MISSING`.
    Fatal,
    /// The control socket closed or failed.
    Dropped { was_listening: bool },
}

async fn session_loop(ctx: SessionContext, active: Arc<AtomicBool>) {
    let mut attempt: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        if attempt > 0 {
            if ctx.config.reconnect.is_exhausted(attempt) {
                error!(attempts = attempt - 1, "giving up reconnecting");
                ctx.emit_error(Error::Transport(format!(
                    "gave up after {} reconnect attempts",
                    attempt - 1
                )));
                break;
            }
            let delay = ctx.config.reconnect.delay(attempt);
            info!(attempt, delay = ?delay, "reconnecting");
            ctx.emit(ServerEvent::Reconnecting { attempt });
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let stream = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            result = ctx.connect(ctx.config.control_port) => result,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "control connection failed");
                let fatal = e.is_fatal_connect();
                ctx.emit_error(e);
                if fatal {
                    break;
                }
                attempt += 1;
                continue;
            }
        };

        debug!("control connection established");
        match ControlSession::new(&ctx, stream).run().await {
            Outcome::Closed | Outcome::Fatal => break,
            Outcome::Dropped { was_listening } => {
                attempt = if was_listening { 1 } else { attempt + 1 };
            }
        }
    }

    active.store(false, Ordering::Release);
    info!("server closed");
    ctx.emit(ServerEvent::Closed);
}

// ---------------------------------------------------------------------------
// Control session
// ---------------------------------------------------------------------------

/// The data socket: read half, pending read bytes and the writer task
/// that owns the write half.
struct DataSocket {
    reader: ReadHalf<BoxedStream>,
    buf: BytesMut,
    writes: mpsc::UnboundedSender<DataWrite>,
    writer: JoinHandle<()>,
}

impl Drop for DataSocket {
    fn drop(&mut self) {
        // A write blocked on a modem that stopped reading must not keep the
        // socket open.
        self.writer.abort();
    }
}

/// Bytes for the data socket writer.
struct DataWrite {
    link: u64,
    data: Bytes,
    reply: oneshot::Sender<Result<()>>,
}

/// A write the writer task finished, successfully or not.
struct WriteDone {
    link: u64,
    len: usize,
    result: std::io::Result<()>,
    reply: oneshot::Sender<Result<()>>,
}

/// State of one control connection and whatever link rides on it.
struct ControlSession<'a> {
    ctx: &'a SessionContext,
    control: BoxedStream,
    control_buf: BytesMut,
    codec: LineCodec,
    queue: CommandQueue,
    /// The modem accepted `LISTEN ON`.
    listening: bool,
    /// The modem considers a link established.
    modem_connected: bool,
    /// Output ended while the modem still held data; waiting for `BUFFER 0`.
    draining: bool,
    /// Server-side view of the link lifecycle.
    link_state: ConnectionState,
    data: Option<DataSocket>,
    link: Option<Link>,
    next_link_id: u64,
    link_tx: mpsc::UnboundedSender<LinkRequest>,
    link_rx: mpsc::UnboundedReceiver<LinkRequest>,
    write_done_tx: mpsc::UnboundedSender<WriteDone>,
    write_done_rx: mpsc::UnboundedReceiver<WriteDone>,
}

impl<'a> ControlSession<'a> {
    fn new(ctx: &'a SessionContext, control: BoxedStream) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (write_done_tx, write_done_rx) = mpsc::unbounded_channel();
        ControlSession {
            ctx,
            control,
            control_buf: BytesMut::with_capacity(READ_CHUNK),
            codec: LineCodec::new(),
            queue: CommandQueue::new(),
            listening: false,
            modem_connected: false,
            draining: false,
            link_state: ConnectionState::Idle,
            data: None,
            link: None,
            next_link_id: 0,
            link_tx,
            link_rx,
            write_done_tx,
            write_done_rx,
        }
    }

    async fn run(mut self) -> Outcome {
        let outcome = match self.handshake().await {
            Ok(()) => self.event_loop().await,
            Err(e) => {
                error!(error = %e, "handshake write failed");
                self.ctx.emit_error(e);
                self.dropped()
            }
        };
        self.finish(outcome);
        outcome
    }

    async fn handshake(&mut self) -> Result<()> {
        self.send_command(Command::version()).await?;
        let my_call = Command::my_call(&self.ctx.config.my_call_signs);
        self.send_command(my_call).await?;
        self.send_command(Command::listen(true)).await
    }

    async fn event_loop(&mut self) -> Outcome {
        loop {
            let step = tokio::select! {
                biased;

                _ = self.ctx.cancel.cancelled() => {
                    debug!("session cancelled");
                    return Outcome::Closed;
                }

                read = self.control.read_buf(&mut self.control_buf) => match read {
                    Ok(0) => {
                        warn!(listening = self.listening, "control connection closed by modem");
                        return self.dropped();
                    }
                    Ok(_) => self.drain_lines().await,
                    Err(e) => {
                        error!(error = %e, "control connection failed");
                        self.report_socket_error(Error::Io(e));
                        return self.dropped();
                    }
                },

                Some(request) = self.link_rx.recv() => {
                    self.handle_link_request(request).await.map(|()| None)
                }

                Some(done) = self.write_done_rx.recv() => {
                    self.handle_write_done(done).await.map(|()| None)
                }

                read = read_data(&mut self.data) => {
                    self.handle_data(read).await.map(|()| None)
                }
            };

            match step {
                Ok(None) => {}
                Ok(Some(outcome)) => return outcome,
                Err(e) => {
                    error!(error = %e, "control write failed");
                    self.report_socket_error(e);
                    return self.dropped();
                }
            }
        }
    }

    fn dropped(&self) -> Outcome {
        Outcome::Dropped {
            was_listening: self.listening,
        }
    }

    /// Release the link and the data socket when the control session ends.
    fn finish(&mut self, outcome: Outcome) {
        if let Some(mut link) = self.link.take() {
            if outcome != Outcome::Closed {
                link.error(Error::ConnectionLost);
            }
            link.teardown();
        }
        self.close_data_socket();
    }

    // -----------------------------------------------------------------------
    // Control channel
    // -----------------------------------------------------------------------

    /// Queue a command, writing whatever the queue releases.
    async fn send_command(&mut self, cmd: Command) -> Result<()> {
        match self.queue.enqueue(cmd) {
            Some(next) => self.write_command(&next).await,
            None => Ok(()),
        }
    }

    async fn write_command(&mut self, cmd: &Command) -> Result<()> {
        debug!("> {}", cmd.text());
        let mut out = BytesMut::new();
        self.codec.encode(cmd.text(), &mut out)?;
        self.control.write_all(&out).await?;
        Ok(())
    }

    async fn drain_lines(&mut self) -> Result<Option<Outcome>> {
        while let Some(line) = self.codec.decode(&mut self.control_buf)? {
            if let Some(outcome) = self.handle_line(&line).await? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    async fn handle_line(&mut self, raw: &str) -> Result<Option<Outcome>> {
        let line = ProtocolLine::parse(raw);
        let notice = match line.notice() {
            Ok(notice) => notice,
            Err(e) => {
                warn!(error = %e, "ignoring malformed line");
                return Ok(None);
            }
        };

        if notice.is_chatter() {
            trace!("< {raw}");
        } else {
            debug!("< {raw}");
        }

        if notice != Notice::Wrong {
            if let Some(advance) = self.queue.on_reply(&line.keyword) {
                self.on_command_completed(&advance.completed, &notice);
                if let Some(next) = advance.next {
                    self.write_command(&next).await?;
                }
            }
        }

        match notice {
            Notice::Pending => {
                self.link_state = ConnectionState::Pending;
                if let Err(e) = self.open_data_socket().await {
                    error!(error = %e, "failed to open data connection");
                    self.ctx.emit_error(e);
                }
            }
            Notice::CancelPending => {
                if !self.modem_connected {
                    debug!(state = %self.link_state, "pending link cancelled");
                    self.link_state = ConnectionState::Idle;
                    self.close_data_socket();
                }
            }
            Notice::Connected { remote, local } => {
                self.on_connected(remote.unwrap_or_default(), local.unwrap_or_default())
                    .await?;
            }
            Notice::Disconnected { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "link disconnected");
                self.modem_connected = false;
                self.ctx.emit(ServerEvent::Disconnected { reason });
                self.disconnect_link().await?;
            }
            Notice::Buffer(count) => {
                let mut writing = false;
                if let Some(link) = self.link.as_mut() {
                    link.buffer_length = count;
                    writing = link.writes_in_flight > 0;
                }
                if self.draining && count == 0 && !writing {
                    debug!("modem buffer drained");
                    self.disconnect_link().await?;
                }
            }
            Notice::Missing => {
                error!("modem reported MISSING, closing session");
                self.ctx
                    .emit_error(Error::Protocol("modem reported MISSING".into()));
                return Ok(Some(Outcome::Fatal));
            }
            Notice::Wrong => {
                let rejection = self.queue.on_wrong();
                let request = rejection.request.unwrap_or_default();
                warn!(request = %request, line = %raw, "modem rejected command");
                if let Some(next) = rejection.next {
                    self.write_command(&next).await?;
                }
                self.ctx.emit_error(Error::Rejected {
                    request,
                    line: raw.to_string(),
                });
            }
            Notice::Busy
            | Notice::IAmAlive
            | Notice::Ptt
            | Notice::Ok
            | Notice::Version(_)
            | Notice::Empty
            | Notice::Other => {}
        }

        Ok(None)
    }

    fn on_command_completed(&mut self, completed: &Command, notice: &Notice) {
        if let Notice::Version(version) = notice {
            info!(version = version.as_deref().unwrap_or("unknown"), "modem version");
        }
        if *completed == Command::listen(true) {
            self.listening = true;
            info!(
                calls = %self.ctx.config.my_call_signs.join(" "),
                "listening for inbound links"
            );
            self.ctx.emit(ServerEvent::Listening(self.ctx.listening_info()));
        }
    }

    async fn on_connected(&mut self, remote: String, local: String) -> Result<()> {
        if let Some(mut stale) = self.link.take() {
            debug!(id = stale.id, remote = %stale.remote, "recycling stale link");
            stale.teardown();
        }
        self.draining = false;

        match self.open_data_socket().await {
            Ok(true) => {}
            // Closing; the cancel branch runs next.
            Ok(false) => return Ok(()),
            Err(e) => {
                error!(error = %e, "failed to open data connection for new link");
                self.ctx.emit_error(e);
                self.modem_connected = true;
                return self.disconnect_link().await;
            }
        }

        self.modem_connected = true;
        self.next_link_id += 1;
        let (link, connection) = Link::new(
            self.next_link_id,
            remote.clone(),
            local.clone(),
            self.ctx.config.receive_high_water_mark,
            self.link_tx.clone(),
        );
        info!(id = link.id, remote = %remote, local = %local, "link connected");
        self.link = Some(link);
        self.link_state = ConnectionState::Connected;

        self.ctx.emit(ServerEvent::Connection { remote, local });
        if self.ctx.accept_tx.send(connection).is_err() {
            debug!("no acceptor for new connection");
        }
        Ok(())
    }

    /// Tear the active link down, telling the modem if it still has it.
    ///
    /// Idempotent: every teardown path ends here.
    async fn disconnect_link(&mut self) -> Result<()> {
        self.draining = false;
        if let Some(mut link) = self.link.take() {
            debug!(
                id = link.id,
                remote = %link.remote,
                local = %link.local,
                "tearing down link"
            );
            link.teardown();
        }
        self.link_state = ConnectionState::Idle;
        self.close_data_socket();
        if self.modem_connected {
            self.modem_connected = false;
            self.send_command(Command::disconnect()).await?;
        }
        Ok(())
    }

    /// Route a socket error to the active connection, or to the server.
    fn report_socket_error(&self, err: Error) {
        match &self.link {
            Some(link) => link.error(err),
            None => self.ctx.emit_error(err),
        }
    }

    // -----------------------------------------------------------------------
    // Data channel
    // -----------------------------------------------------------------------

    /// Connect the data port unless already connected.
    ///
    /// Returns `Ok(false)` if the server was closed while connecting.
    async fn open_data_socket(&mut self) -> Result<bool> {
        if self.data.is_some() {
            return Ok(true);
        }
        let port = self.ctx.config.data_port;
        let stream = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => {
                debug!(port, "data connect abandoned");
                return Ok(false);
            }
            result = self.ctx.connect(port) => result?,
        };
        debug!(port, "data connection established");

        let (reader, writer) = tokio::io::split(stream);
        let (writes, write_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(
            data_writer(writer, write_rx, self.write_done_tx.clone()).in_current_span(),
        );
        self.data = Some(DataSocket {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            writes,
            writer,
        });
        Ok(true)
    }

    fn close_data_socket(&mut self) {
        if self.data.take().is_some() {
            debug!("data connection closed");
        }
    }

    async fn handle_data(&mut self, read: std::io::Result<Option<Bytes>>) -> Result<()> {
        match read {
            Ok(Some(chunk)) => {
                match &self.link {
                    Some(link) => {
                        debug!(id = link.id, len = chunk.len(), "< data {}", summarize(&chunk));
                        if let Err(e) = link.push_data(chunk) {
                            warn!(id = link.id, error = %e, "consumer is not reading");
                            link.error(e);
                        }
                    }
                    None => warn!("lost received data {}", summarize(&chunk)),
                }
                Ok(())
            }
            Ok(None) => {
                debug!("data connection closed by modem");
                self.disconnect_link().await
            }
            Err(e) => {
                warn!(error = %e, "data connection failed");
                self.report_socket_error(Error::Io(e));
                self.disconnect_link().await
            }
        }
    }

    async fn handle_link_request(&mut self, request: LinkRequest) -> Result<()> {
        match request {
            LinkRequest::Write { id, data, reply } => {
                let Some(link) = self.link.as_mut().filter(|l| l.id == id && !l.output_ended)
                else {
                    trace!(id, len = data.len(), "write for finished link dropped");
                    let _ = reply.send(Ok(()));
                    return Ok(());
                };
                if data.is_empty() {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                let Some(socket) = self.data.as_ref() else {
                    let _ = reply.send(Err(Error::NotConnected));
                    return Ok(());
                };

                let len = data.len();
                let preview = summarize(&data);
                match socket.writes.send(DataWrite {
                    link: id,
                    data,
                    reply,
                }) {
                    Ok(()) => {
                        link.writes_in_flight += 1;
                        debug!(id, len, "> data {preview}");
                    }
                    Err(mpsc::error::SendError(write)) => {
                        warn!(id, "data writer gone");
                        let _ = write.reply.send(Err(Error::ConnectionLost));
                    }
                }
                Ok(())
            }
            LinkRequest::End { id } => {
                let Some(link) = self.link.as_mut().filter(|l| l.id == id && !l.output_ended)
                else {
                    return Ok(());
                };
                link.output_ended = true;
                if self.modem_connected && (link.buffer_length > 0 || link.writes_in_flight > 0) {
                    debug!(id, pending = link.buffer_length, "draining modem buffer");
                    link.set_state(ConnectionState::Draining);
                    self.draining = true;
                    self.link_state = ConnectionState::Draining;
                    Ok(())
                } else {
                    self.disconnect_link().await
                }
            }
            LinkRequest::Destroy { id } => {
                if self.link.as_ref().is_some_and(|l| l.id == id) {
                    self.disconnect_link().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Account for a finished data write and answer the writer.
    async fn handle_write_done(&mut self, done: WriteDone) -> Result<()> {
        let WriteDone {
            link: id,
            len,
            result,
            reply,
        } = done;
        let current = self.link.as_mut().filter(|l| l.id == id);

        match result {
            Ok(()) => {
                if let Some(link) = current {
                    link.writes_in_flight = link.writes_in_flight.saturating_sub(1);
                    link.buffer_length += len as u64;
                }
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                let is_current = current.is_some();
                warn!(id, error = %e, "data write failed");
                let _ = reply.send(Err(Error::ConnectionLost));
                if is_current {
                    self.disconnect_link().await
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Owns the data socket's write half. Stops after the first failed write.
async fn data_writer(
    mut writer: WriteHalf<BoxedStream>,
    mut writes: mpsc::UnboundedReceiver<DataWrite>,
    done: mpsc::UnboundedSender<WriteDone>,
) {
    while let Some(DataWrite { link, data, reply }) = writes.recv().await {
        let result = match writer.write_all(&data).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        let sent = done.send(WriteDone {
            link,
            len: data.len(),
            result,
            reply,
        });
        if sent.is_err() || failed {
            break;
        }
    }
    trace!("data writer stopped");
}

/// Read the next chunk from the data socket; pending forever without one.
async fn read_data(data: &mut Option<DataSocket>) -> std::io::Result<Option<Bytes>> {
    let Some(socket) = data.as_mut() else {
        return std::future::pending().await;
    };
    socket.buf.reserve(READ_CHUNK);
    match socket.reader.read_buf(&mut socket.buf).await? {
        0 => Ok(None),
        _ => Ok(Some(socket.buf.split().freeze())),
    }
}
