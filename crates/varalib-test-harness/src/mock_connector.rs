//! In-memory socket factory for deterministic protocol tests.
//!
//! [`MockConnector`] implements [`Connector`] by handing out one end of a
//! `tokio::io::duplex` pipe and sending the other end to the test as a
//! [`MockPeer`]. Connect outcomes can be scripted per port, and every
//! attempt is counted, so reconnect behaviour is observable. A peer can
//! also make the client's side of its pipe fail, to exercise socket error
//! paths.
//!
//! # Example
//!
//! ```
//! use varalib_core::Connector;
//! use varalib_test_harness::{ConnectBehavior, MockConnector};
//!
//! # async fn example() -> varalib_core::Result<()> {
//! let (connector, mut peers) = MockConnector::new();
//! connector.script(8300, ConnectBehavior::Refuse);
//!
//! assert!(connector.connect("localhost", 8300).await.is_err());
//! let _control = connector.connect("localhost", 8300).await?;
//! let mut modem = peers.next().await?;
//! modem.expect_line("VERSION").await.ok();
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use varalib_core::error::{Error, Result};
use varalib_core::transport::{BoxedStream, Connector};
use varalib_protocol::LineCodec;

/// How long peer helpers wait before giving up with [`Error::Timeout`].
pub const PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// The outcome of one scripted connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connect and hand the other end to the test.
    Accept,
    /// Fail with [`Error::ConnectionRefused`].
    Refuse,
    /// Fail with [`Error::Timeout`].
    TimeOut,
    /// Fail with a retryable [`Error::Transport`].
    Fail(String),
    /// Never complete, so the caller's own connect timeout fires.
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    behaviors: HashMap<u16, VecDeque<ConnectBehavior>>,
    attempts: HashMap<u16, usize>,
}

/// A scripted [`Connector`] over in-memory pipes.
///
/// Unscripted attempts accept. Clones share the same script and attempt
/// counters, so a test can keep one clone while the server owns another.
#[derive(Debug, Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    /// Create a connector and the receiver for the peers it accepts.
    pub fn new() -> (Self, MockPeers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = MockConnector {
            script: Arc::new(Mutex::new(Script::default())),
            peers: tx,
        };
        (connector, MockPeers { rx })
    }

    /// Queue the outcome of the next unscripted attempt on `port`.
    pub fn script(&self, port: u16, behavior: ConnectBehavior) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.behaviors.entry(port).or_default().push_back(behavior);
    }

    /// Number of connect attempts made to `port` so far.
    pub fn attempts(&self, port: u16) -> usize {
        let script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.attempts.get(&port).copied().unwrap_or(0)
    }

    fn next_behavior(&self, port: u16) -> ConnectBehavior {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        *script.attempts.entry(port).or_default() += 1;
        script
            .behaviors
            .get_mut(&port)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ConnectBehavior::Accept)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        match self.next_behavior(port) {
            ConnectBehavior::Accept => {
                let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
                let fault = Arc::new(AtomicBool::new(false));
                let mut peer = MockPeer::new(host, port, Box::new(theirs));
                peer.fault = Some(fault.clone());
                self.peers
                    .send(peer)
                    .map_err(|_| Error::Transport("mock peer receiver dropped".into()))?;
                Ok(Box::new(ClientStream { inner: ours, fault }))
            }
            ConnectBehavior::Refuse => Err(Error::ConnectionRefused(format!("{host}:{port}"))),
            ConnectBehavior::TimeOut => Err(Error::Timeout),
            ConnectBehavior::Fail(msg) => Err(Error::Transport(msg)),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}

/// The client's end of a mock pipe. Reads fail with `ConnectionReset` once
/// its peer calls [`MockPeer::fail_client_reads`].
struct ClientStream {
    inner: DuplexStream,
    fault: Arc<AtomicBool>,
}

impl ClientStream {
    fn check(&self) -> io::Result<()> {
        if self.fault.load(Ordering::Acquire) {
            Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected read failure",
            ))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.check()?;
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        // The wake-up byte itself is swallowed by the failure.
        Poll::Ready(self.check())
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Receives the peers of accepted mock connections, in connect order.
#[derive(Debug)]
pub struct MockPeers {
    rx: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockPeers {
    /// Wait for the next accepted connection.
    pub async fn next(&mut self) -> Result<MockPeer> {
        match tokio::time::timeout(PEER_TIMEOUT, self.rx.recv()).await {
            Ok(Some(peer)) => Ok(peer),
            Ok(None) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Take an already-accepted connection without waiting.
    pub fn try_next(&mut self) -> Option<MockPeer> {
        self.rx.try_recv().ok()
    }
}

/// The modem's end of a mock or real socket.
///
/// Line helpers speak the CR-terminated control protocol; byte helpers
/// serve the raw data channel. Every read gives up after [`PEER_TIMEOUT`].
pub struct MockPeer {
    host: String,
    port: u16,
    stream: BoxedStream,
    buf: BytesMut,
    codec: LineCodec,
    /// Read-failure switch of the client end, for in-memory pipes.
    fault: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl MockPeer {
    /// Wrap the modem side of a connected stream.
    pub fn new(host: &str, port: u16, stream: BoxedStream) -> Self {
        MockPeer {
            host: host.to_string(),
            port,
            stream,
            buf: BytesMut::new(),
            codec: LineCodec::new(),
            fault: None,
        }
    }

    /// Host the client connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the client connected to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Read one CR-terminated line. `Ok(None)` at end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(line));
            }
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Read one line and fail unless it equals `expected`.
    pub async fn expect_line(&mut self, expected: &str) -> Result<()> {
        match self.read_line().await? {
            Some(line) if line == expected => Ok(()),
            Some(line) => Err(Error::Protocol(format!(
                "expected line {expected:?}, got {line:?}"
            ))),
            None => Err(Error::Protocol(format!(
                "expected line {expected:?}, got end of stream"
            ))),
        }
    }

    /// Write `line` followed by CR.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut out = BytesMut::new();
        self.codec.encode(line, &mut out)?;
        self.write(&out).await
    }

    /// Write raw bytes.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Return whatever bytes are buffered or next arrive. `Ok(None)` at end
    /// of stream.
    pub async fn read_some(&mut self) -> Result<Option<Bytes>> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(Error::ConnectionLost);
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Whether the other side closes the stream within `within`.
    ///
    /// Bytes that arrive meanwhile are kept for later reads.
    pub async fn is_closed(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Fail if anything arrives within `within`, or if the stream closes.
    pub async fn expect_quiet(&mut self, within: Duration) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::Protocol(format!(
                "expected silence, have {} unread bytes",
                self.buf.len()
            )));
        }
        match tokio::time::timeout(within, self.stream.read_buf(&mut self.buf)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(Error::ConnectionLost),
            Ok(Ok(n)) => Err(Error::Protocol(format!(
                "expected silence, received {n} bytes"
            ))),
            Ok(Err(e)) => Err(Error::Io(e)),
        }
    }

    /// Make every further read on the client's end fail with
    /// `ConnectionReset`, waking a client already blocked in a read.
    ///
    /// Only peers of a [`MockConnector`] support this.
    pub async fn fail_client_reads(&mut self) -> Result<()> {
        let Some(fault) = &self.fault else {
            return Err(Error::InvalidParameter(
                "read failures need a MockConnector pipe".into(),
            ));
        };
        fault.store(true, Ordering::Release);
        self.write(&[0]).await
    }

    /// Shut down the write half, as a modem closing its socket would.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize> {
        match tokio::time::timeout(PEER_TIMEOUT, self.stream.read_buf(&mut self.buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_pairs_client_with_peer() {
        let (connector, mut peers) = MockConnector::new();
        let mut client = connector.connect("modem", 8300).await.unwrap();
        let mut peer = peers.next().await.unwrap();
        assert_eq!(peer.host(), "modem");
        assert_eq!(peer.port(), 8300);

        client.write_all(b"VERSION\rMYCALL N0CALL\r").await.unwrap();
        peer.expect_line("VERSION").await.unwrap();
        assert_eq!(peer.read_line().await.unwrap().as_deref(), Some("MYCALL N0CALL"));

        peer.send_line("OK").await.unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK\r");
    }

    #[tokio::test]
    async fn scripted_behaviors_apply_once_each() {
        let (connector, mut peers) = MockConnector::new();
        connector.script(8300, ConnectBehavior::Refuse);
        connector.script(8300, ConnectBehavior::TimeOut);
        connector.script(8300, ConnectBehavior::Fail("reset".into()));

        assert!(matches!(
            connector.connect("h", 8300).await,
            Err(Error::ConnectionRefused(_))
        ));
        assert!(matches!(connector.connect("h", 8300).await, Err(Error::Timeout)));
        assert!(matches!(
            connector.connect("h", 8300).await,
            Err(Error::Transport(_))
        ));
        assert!(connector.connect("h", 8300).await.is_ok());
        assert_eq!(connector.attempts(8300), 4);
        assert_eq!(connector.attempts(8301), 0);
        assert!(peers.try_next().is_some());
        assert!(peers.try_next().is_none());
    }

    #[tokio::test]
    async fn hang_never_completes() {
        let (connector, _peers) = MockConnector::new();
        connector.script(8300, ConnectBehavior::Hang);
        let result =
            tokio::time::timeout(Duration::from_millis(50), connector.connect("h", 8300)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn peer_sees_close() {
        let (connector, mut peers) = MockConnector::new();
        let client = connector.connect("h", 8301).await.unwrap();
        let mut peer = peers.next().await.unwrap();

        assert!(!peer.is_closed(Duration::from_millis(20)).await);
        drop(client);
        assert!(peer.is_closed(Duration::from_millis(500)).await);
        assert_eq!(peer.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn raw_bytes_round_trip() {
        let (connector, mut peers) = MockConnector::new();
        let mut client = connector.connect("h", 8301).await.unwrap();
        let mut peer = peers.next().await.unwrap();

        client.write_all(&[0x00, 0xFF, b'\r', 0x80]).await.unwrap();
        let got = peer.read_exact(4).await.unwrap();
        assert_eq!(&got[..], &[0x00, 0xFF, b'\r', 0x80]);

        peer.write(b"hello").await.unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn expect_quiet_flags_traffic() {
        let (connector, mut peers) = MockConnector::new();
        let mut client = connector.connect("h", 8300).await.unwrap();
        let mut peer = peers.next().await.unwrap();

        peer.expect_quiet(Duration::from_millis(20)).await.unwrap();
        client.write_all(b"LISTEN ON\r").await.unwrap();
        assert!(matches!(
            peer.expect_quiet(Duration::from_millis(200)).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn failed_client_reads_report_reset() {
        let (connector, mut peers) = MockConnector::new();
        let mut client = connector.connect("h", 8301).await.unwrap();
        let mut peer = peers.next().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let err = client.read(&mut buf).await.unwrap_err();
            (err.kind(), client)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.fail_client_reads().await.unwrap();

        let (kind, mut client) = reader.await.unwrap();
        assert_eq!(kind, io::ErrorKind::ConnectionReset);

        // Writes still go through.
        client.write_all(b"x").await.unwrap();
        assert_eq!(&peer.read_exact(1).await.unwrap()[..], b"x");
    }
}
