//! Core types used throughout varalib.

use std::fmt;
use std::str::FromStr;

/// Which VARA program the server talks to.
///
/// Both flavours speak the same TCP control protocol; the kind is carried
/// for identification in logs and [`ListeningInfo`](crate::ListeningInfo).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModemKind {
    /// VARA HF.
    #[default]
    Hf,
    /// VARA FM.
    Fm,
}

impl fmt::Display for ModemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModemKind::Hf => write!(f, "HF"),
            ModemKind::Fm => write!(f, "FM"),
        }
    }
}

/// Error returned when parsing a [`ModemKind`] from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModemKindError(String);

impl fmt::Display for ParseModemKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown modem kind '{}' (expected HF or FM)", self.0)
    }
}

impl std::error::Error for ParseModemKindError {}

impl FromStr for ModemKind {
    type Err = ParseModemKindError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("hf") {
            Ok(ModemKind::Hf)
        } else if s.eq_ignore_ascii_case("fm") {
            Ok(ModemKind::Fm)
        } else {
            Err(ParseModemKindError(s.to_string()))
        }
    }
}

/// Lifecycle of one logical radio link.
///
/// ```text
/// Idle -> Pending -> Connected -> Draining -> Disconnected
///           |            \______________________/^
///           +--(CANCELPENDING)--> Idle
/// ```
///
/// A `Connection` handle only ever observes `Connected`, `Draining` and
/// `Disconnected`; `Idle` and `Pending` describe the server side before a
/// link is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link and no data socket.
    #[default]
    Idle,
    /// The modem reported an inbound link is pending; the data socket is open.
    Pending,
    /// The link is established and data flows both ways.
    Connected,
    /// Output has ended locally; waiting for the modem to transmit its buffer.
    Draining,
    /// The link is gone. Terminal.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Pending => "pending",
            ConnectionState::Connected => "connected",
            ConnectionState::Draining => "draining",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}
