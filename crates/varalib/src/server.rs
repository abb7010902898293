//! The public entry point.
//!
//! A [`Server`] listens for inbound radio links through a VARA modem. It
//! owns at most one session task at a time; `listen()` starts one and
//! `close()` stops it. Progress is reported as [`ServerEvent`]s on a
//! broadcast channel, and each established link is handed out by
//! [`Server::accept`] as a [`Connection`].
//!
//! Usage errors (listening twice, closing a server that is not listening,
//! an incomplete configuration) are returned directly and never appear as
//! events.
//!
//! # Example
//!
//! ```no_run
//! use varalib::{ListenConfig, Server};
//!
//! # async fn example() -> varalib::Result<()> {
//! let mut server = Server::new();
//! let mut events = server.subscribe();
//! server.listen(
//!     ListenConfig::new()
//!         .host("127.0.0.1")
//!         .control_port(8300)
//!         .my_call("N0CALL"),
//! )?;
//!
//! while let Some(mut conn) = server.accept().await {
//!     conn.write(b"hello\r").await?;
//!     conn.end().await;
//! }
//! # let _ = events.try_recv();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{broadcast, mpsc};

use varalib_core::error::{Error, Result};
use varalib_core::events::ServerEvent;
use varalib_core::transport::Connector;
use varalib_transport::TcpConnector;

use crate::config::ListenConfig;
use crate::connection::Connection;
use crate::session::{SessionHandle, spawn_session};

/// Capacity of the server event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Listens for radio links through a VARA modem.
pub struct Server {
    connector: Arc<dyn Connector>,
    event_tx: broadcast::Sender<ServerEvent>,
    session: Option<SessionHandle>,
    accept_rx: Option<mpsc::UnboundedReceiver<Connection>>,
}

impl Server {
    /// A server that reaches the modem over TCP.
    pub fn new() -> Self {
        Self::with_connector(TcpConnector::new())
    }

    /// A server that opens its sockets through `connector`.
    pub fn with_connector(connector: impl Connector + 'static) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Server {
            connector: Arc::new(connector),
            event_tx,
            session: None,
            accept_rx: None,
        }
    }

    /// Subscribe to server events.
    ///
    /// Only events sent after this call are received, so subscribe before
    /// calling [`listen`](Server::listen).
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a `listen()` is in effect: from the call until `close()`, or
    /// until the session gives up on its own.
    pub fn is_listening(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.active.load(Ordering::Acquire))
    }

    /// Start listening.
    ///
    /// Returns once the session task is started; the handshake result
    /// arrives as [`ServerEvent::Listening`] or [`ServerEvent::Error`].
    pub fn listen(&mut self, config: ListenConfig) -> Result<()> {
        if self.is_listening() {
            return Err(Error::AlreadyListening);
        }
        let config = config.validate()?;

        if let Some(previous) = self.session.take() {
            previous.cancel.cancel();
        }

        tracing::info!(
            host = %config.host,
            control_port = config.control_port,
            data_port = config.data_port,
            kind = %config.kind,
            "listening"
        );

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        self.accept_rx = Some(accept_rx);
        self.session = Some(spawn_session(
            self.connector.clone(),
            config,
            self.event_tx.clone(),
            accept_tx,
        ));
        Ok(())
    }

    /// Stop listening. The control socket is dropped at once and an active
    /// connection is torn down; [`ServerEvent::Closed`] follows.
    pub fn close(&mut self) -> Result<()> {
        match &self.session {
            Some(session) if session.active.swap(false, Ordering::AcqRel) => {
                tracing::debug!("closing server");
                session.cancel.cancel();
                Ok(())
            }
            _ => Err(Error::NotListening),
        }
    }

    /// Wait for the next established link.
    ///
    /// Returns `None` once the server has stopped and every pending
    /// connection has been taken.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accept_rx.as_mut()?.recv().await
    }

    /// Wait until the session task has finished.
    pub async fn closed(&mut self) {
        let task = self.session.as_mut().and_then(|session| session.task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}
