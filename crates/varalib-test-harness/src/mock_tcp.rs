//! A modem stand-in on real TCP sockets.
//!
//! [`MockTcpModem`] binds a control listener and a data listener on random
//! localhost ports. The test accepts each socket as a [`MockPeer`] and
//! plays the modem's side of the protocol by hand, which exercises
//! `TcpConnector` and the session end to end.
//!
//! # Example
//!
//! ```
//! use varalib_test_harness::MockTcpModem;
//!
//! # async fn example() -> varalib_core::Result<()> {
//! let modem = MockTcpModem::bind().await?;
//! let (control, data) = (modem.control_port(), modem.data_port());
//! // ... point a server at 127.0.0.1:control with data port `data` ...
//! let mut peer = modem.accept_control().await?;
//! peer.expect_line("VERSION").await?;
//! peer.send_line("VERSION 4.8.1").await?;
//! # let _ = (control, data);
//! # Ok(())
//! # }
//! ```

use tokio::net::TcpListener;

use varalib_core::error::{Error, Result};

use crate::mock_connector::{MockPeer, PEER_TIMEOUT};

/// Control and data listeners standing in for a VARA modem.
#[derive(Debug)]
pub struct MockTcpModem {
    control: TcpListener,
    data: TcpListener,
    control_port: u16,
    data_port: u16,
}

impl MockTcpModem {
    /// Bind both listeners on `127.0.0.1` with OS-assigned ports.
    pub async fn bind() -> Result<Self> {
        let control = bind_local().await?;
        let data = bind_local().await?;
        Ok(MockTcpModem {
            control_port: control.local_addr()?.port(),
            data_port: data.local_addr()?.port(),
            control,
            data,
        })
    }

    /// Host the listeners are bound to.
    pub fn host(&self) -> &'static str {
        "127.0.0.1"
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Accept the next control connection.
    pub async fn accept_control(&self) -> Result<MockPeer> {
        accept(&self.control, self.control_port).await
    }

    /// Accept the next data connection.
    pub async fn accept_data(&self) -> Result<MockPeer> {
        accept(&self.data, self.data_port).await
    }
}

async fn bind_local() -> Result<TcpListener> {
    TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Transport(format!("failed to bind mock modem listener: {e}")))
}

async fn accept(listener: &TcpListener, port: u16) -> Result<MockPeer> {
    let (stream, peer_addr) = tokio::time::timeout(PEER_TIMEOUT, listener.accept())
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(MockPeer::new(&peer_addr.ip().to_string(), port, Box::new(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn control_and_data_ports_differ() {
        let modem = MockTcpModem::bind().await.unwrap();
        assert_ne!(modem.control_port(), modem.data_port());
        assert_ne!(modem.control_port(), 0);
    }

    #[tokio::test]
    async fn accept_control_speaks_lines() {
        let modem = MockTcpModem::bind().await.unwrap();
        let mut client = TcpStream::connect((modem.host(), modem.control_port()))
            .await
            .unwrap();
        let mut peer = modem.accept_control().await.unwrap();
        assert_eq!(peer.port(), modem.control_port());

        client.write_all(b"LISTEN ON\r").await.unwrap();
        peer.expect_line("LISTEN ON").await.unwrap();

        peer.send_line("OK").await.unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK\r");
    }

    #[tokio::test]
    async fn accept_times_out_without_client() {
        let modem = MockTcpModem::bind().await.unwrap();
        assert!(matches!(modem.accept_data().await, Err(Error::Timeout)));
    }
}
