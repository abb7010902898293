//! Error types for varalib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer,
//! flow-control and usage errors are all captured here.

/// The error type for all varalib operations.
///
/// Variants cover the failure modes of talking to a VARA modem: the
/// control or data socket failing to connect, the modem rejecting a
/// command, a consumer falling behind on received data, and programmer
/// errors such as listening twice.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error on the control or data socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// The modem refused the TCP connection (nothing listening on the port).
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// A protocol-level error (modem desync, malformed status line).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The modem answered `WRONG` to a command.
    #[error("modem rejected `{request}`: {line}")]
    Rejected {
        /// The command the rejection was a response to.
        request: String,
        /// The line received from the modem.
        line: String,
    },

    /// Timed out connecting to the modem.
    #[error("timed out")]
    Timeout,

    /// An invalid parameter was passed, usually a bad listen configuration.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// `listen()` was called on a server that is already listening.
    #[error("server is already listening")]
    AlreadyListening,

    /// `close()` was called on a server that is not listening.
    #[error("server is not listening")]
    NotListening,

    /// No link to the modem has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the modem was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// Data arrived for a connection whose consumer had not drained the
    /// previous data.
    #[error("receive buffer overflow: {0}")]
    ReceiveBufferOverflow(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// A short, stable error code in the style of node's `err.code`.
    ///
    /// Returns `None` for errors that have no conventional code.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::ConnectionRefused(_) => Some("ECONNREFUSED"),
            Error::Timeout => Some("ETIMEDOUT"),
            Error::AlreadyListening => Some("ERR_SERVER_ALREADY_LISTEN"),
            Error::NotListening => Some("ERR_SERVER_NOT_RUNNING"),
            Error::InvalidParameter(_) => Some("ERR_INVALID_ARG_VALUE"),
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                std::io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                std::io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether this error, raised while connecting the control socket,
    /// ends the current `listen()` instead of being retried.
    ///
    /// A refused connection or a connect timeout means the modem is not
    /// running (or the host is unreachable); retrying in a loop would only
    /// spin.
    pub fn is_fatal_connect(&self) -> bool {
        matches!(self.code(), Some("ECONNREFUSED") | Some("ETIMEDOUT"))
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
