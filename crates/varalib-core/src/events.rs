//! Asynchronous server event types.
//!
//! Events are emitted by a listening server through a
//! [`tokio::sync::broadcast`] channel. Applications subscribe to follow the
//! modem session (listening, reconnects, errors) without polling. The
//! [`Connection`](ServerEvent::Connection) event only announces a new link;
//! the stream object itself is handed out by `Server::accept()`.

use std::sync::Arc;

use crate::error::Error;
use crate::types::ModemKind;

/// Identity reported once the modem has accepted `LISTEN ON`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningInfo {
    /// The call signs registered with `MYCALL`.
    pub my_call_signs: Vec<String>,
    /// Host of the modem.
    pub host: String,
    /// Control port of the modem.
    pub control_port: u16,
    /// Data port of the modem.
    pub data_port: u16,
    /// Which VARA flavour the server was configured for.
    pub kind: ModemKind,
}

/// An event emitted by a server while it listens for radio links.
///
/// Events are delivered in the order the session task produced them. Slow
/// subscribers may miss events when the broadcast channel lags.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The modem accepted the handshake and is listening for inbound links.
    Listening(ListeningInfo),

    /// A radio link was established. The matching `Connection` is queued
    /// for `Server::accept()` right after this event is sent.
    Connection {
        /// Remote call sign.
        remote: String,
        /// Local call sign the remote station connected to.
        local: String,
    },

    /// The modem reported the active link ended.
    Disconnected {
        /// Reason text following `DISCONNECTED`, if any.
        reason: Option<String>,
    },

    /// An asynchronous error. Usage errors are returned synchronously
    /// instead and never appear here.
    Error(Arc<Error>),

    /// The control connection dropped and a new attempt is starting.
    Reconnecting {
        /// The reconnection attempt number (1-based).
        attempt: u32,
    },

    /// The server stopped listening. No further events follow for this
    /// `listen()` call.
    Closed,
}
