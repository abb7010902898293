//! TCP socket factory.
//!
//! VARA HF and VARA FM both expose a control port (8300 by default) and a
//! data port (normally control + 1) on the machine running the modem.
//! [`TcpConnector`] dials either one and hands back the stream boxed as a
//! [`BoxedStream`]. Connect timeouts are applied by the session, not here.

use async_trait::async_trait;
use tokio::net::TcpStream;

use varalib_core::error::{Error, Result};
use varalib_core::transport::{BoxedStream, Connector};

/// Opens TCP connections to the modem.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// A connector with Nagle's algorithm disabled.
    ///
    /// Control lines are a few bytes each and the modem reacts to them
    /// immediately, so coalescing only adds latency.
    pub fn new() -> Self {
        TcpConnector { nodelay: true }
    }

    /// Set `TCP_NODELAY` on connected sockets (default `true`).
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        tracing::debug!(host = %host, port, "connecting to modem");

        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            tracing::error!(host = %host, port, error = %e, "TCP connect failed");
            map_connect_error(e, host, port)
        })?;

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(
                    host = %host,
                    port,
                    error = %e,
                    "failed to set TCP_NODELAY (continuing anyway)"
                );
            }
        }

        tracing::debug!(host = %host, port, "TCP connection established");
        Ok(Box::new(stream))
    }
}

/// Map a connect-time I/O error to the appropriate [`Error`] variant.
fn map_connect_error(e: std::io::Error, host: &str, port: u16) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(format!("{host}:{port}")),
        std::io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Helper: bind a TcpListener on a random available port.
    async fn test_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn connect_write_read() {
        let (listener, port) = test_listener().await;

        // Echo one message back.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = TcpConnector::new().connect("127.0.0.1", port).await.unwrap();
        stream.write_all(b"VERSION\r").await.unwrap();

        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"VERSION\r");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused() {
        // Bind and drop so nothing is listening on the port.
        let (listener, port) = test_listener().await;
        drop(listener);

        let err = match TcpConnector::new().connect("127.0.0.1", port).await {
            Ok(_) => panic!("expected connect to fail"),
            Err(e) => e,
        };
        match &err {
            Error::ConnectionRefused(addr) => assert_eq!(addr, &format!("127.0.0.1:{port}")),
            other => panic!("expected ConnectionRefused, got: {other:?}"),
        }
        assert_eq!(err.code(), Some("ECONNREFUSED"));
        assert!(err.is_fatal_connect());
    }

    #[tokio::test]
    async fn peer_close_reads_eof() {
        let (listener, port) = test_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut stream = TcpConnector::new()
            .nodelay(false)
            .connect("127.0.0.1", port)
            .await
            .unwrap();
        server.await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn timed_out_maps_to_timeout() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(map_connect_error(e, "h", 1), Error::Timeout));

        let e = std::io::Error::other("boom");
        assert!(matches!(map_connect_error(e, "h", 1), Error::Io(_)));
    }
}
