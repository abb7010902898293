//! Socket-factory trait for modem communication.
//!
//! The [`Connector`] trait abstracts over how byte streams to the modem are
//! opened. The production implementation (`TcpConnector` in
//! `varalib-transport`) dials TCP; the mocks in `varalib-test-harness`
//! hand out in-memory duplex pipes so the protocol engine can be tested
//! deterministically.
//!
//! A connected stream is any [`ByteStream`]: readable, writable, and
//! movable into the session task. Closing a stream is dropping it (after an
//! optional `shutdown()`).

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A connected, bidirectional byte stream to the modem.
///
/// Blanket-implemented for every `AsyncRead + AsyncWrite + Unpin + Send`
/// type, so `TcpStream` and `tokio::io::DuplexStream` both qualify.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A boxed [`ByteStream`], as returned by [`Connector::connect`].
pub type BoxedStream = Box<dyn ByteStream>;

/// Opens byte streams to a host and port.
///
/// The server calls `connect` once for the control port at `listen()` (and
/// again on every reconnect), and once for the data port whenever the modem
/// announces a pending or established link. Connect timeouts are applied by
/// the caller, so implementations may simply await the underlying connect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to `host:port`.
    ///
    /// A refused connection should be reported as
    /// [`Error::ConnectionRefused`](crate::error::Error::ConnectionRefused)
    /// and a timeout as [`Error::Timeout`](crate::error::Error::Timeout);
    /// both end the current listen attempt instead of being retried.
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream>;
}
