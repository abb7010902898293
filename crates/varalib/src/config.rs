//! Listen configuration.
//!
//! [`ListenConfig`] is a fluent builder in the usual `mut self -> Self`
//! style. Nothing is checked until [`Server::listen`](crate::Server::listen),
//! which validates it and reports problems as
//! [`Error::InvalidParameter`] before any socket is opened.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use varalib::{ListenConfig, ModemKind, ReconnectPolicy};
//!
//! let config = ListenConfig::new()
//!     .host("127.0.0.1")
//!     .control_port(8300)
//!     .my_call("N0CALL")
//!     .kind(ModemKind::Fm)
//!     .connect_timeout(Duration::from_secs(2))
//!     .reconnect(ReconnectPolicy::default().max_attempts(10));
//! ```

use std::time::Duration;

use varalib_core::error::{Error, Result};
use varalib_core::types::ModemKind;

/// Default connect timeout for both the control and the data socket.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of received bytes a consumer may leave unread before
/// further data is reported as an overflow.
const DEFAULT_HIGH_WATER_MARK: usize = 4 * 1024;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How the control connection is re-established after it drops.
///
/// The delay before attempt `n` is `initial_delay * 2^(n-1)`, capped at
/// `max_delay`. The attempt counter restarts at 1 whenever a session had
/// reached the listening state before it dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect at once, forever.
    pub fn immediate() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Delay before the first reconnect attempt (default: 250ms).
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Upper bound for the doubled delay (default: 30s).
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Give up after this many consecutive attempts (default: never).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether attempt `attempt` is beyond the configured maximum.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Parameters for [`Server::listen`](crate::Server::listen).
///
/// `host`, `control_port` and at least one call sign are required. The
/// data port defaults to `control_port + 1`, which is where VARA puts it.
#[derive(Debug, Clone, Default)]
pub struct ListenConfig {
    host: Option<String>,
    control_port: Option<u16>,
    data_port: Option<u16>,
    my_call_signs: Vec<String>,
    kind: ModemKind,
    connect_timeout: Option<Duration>,
    receive_high_water_mark: Option<usize>,
    reconnect: ReconnectPolicy,
}

impl ListenConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host running the modem.
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// The modem's control port (VARA default: 8300).
    pub fn control_port(mut self, port: u16) -> Self {
        self.control_port = Some(port);
        self
    }

    /// The modem's data port (default: control port + 1).
    pub fn data_port(mut self, port: u16) -> Self {
        self.data_port = Some(port);
        self
    }

    /// Add a call sign to register with `MYCALL`.
    pub fn my_call(mut self, call: &str) -> Self {
        self.my_call_signs.push(call.to_string());
        self
    }

    /// Replace the call signs registered with `MYCALL`.
    pub fn my_call_signs<I, S>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.my_call_signs = calls.into_iter().map(Into::into).collect();
        self
    }

    /// Which VARA flavour is on the other end (default: HF).
    pub fn kind(mut self, kind: ModemKind) -> Self {
        self.kind = kind;
        self
    }

    /// Connect timeout for the control and data sockets (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Unread received bytes allowed per connection (default: 4 KiB).
    pub fn receive_high_water_mark(mut self, bytes: usize) -> Self {
        self.receive_high_water_mark = Some(bytes);
        self
    }

    /// Reconnect behaviour for the control connection.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Check the configuration and fill in defaults.
    pub(crate) fn validate(&self) -> Result<SessionConfig> {
        let host = match self.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(Error::InvalidParameter("host is required".into())),
        };

        let control_port = match self.control_port {
            Some(0) => {
                return Err(Error::InvalidParameter(
                    "control_port must be non-zero".into(),
                ));
            }
            Some(port) => port,
            None => return Err(Error::InvalidParameter("control_port is required".into())),
        };

        let data_port = match self.data_port {
            Some(0) => return Err(Error::InvalidParameter("data_port must be non-zero".into())),
            Some(port) => port,
            None => control_port.checked_add(1).ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "no default data_port after control_port {control_port}"
                ))
            })?,
        };

        if self.my_call_signs.is_empty() {
            return Err(Error::InvalidParameter(
                "at least one call sign is required".into(),
            ));
        }
        for call in &self.my_call_signs {
            if call.is_empty() || call.chars().any(char::is_whitespace) {
                return Err(Error::InvalidParameter(format!(
                    "invalid call sign {call:?}"
                )));
            }
        }

        let receive_high_water_mark = self
            .receive_high_water_mark
            .unwrap_or(DEFAULT_HIGH_WATER_MARK);
        if receive_high_water_mark == 0 {
            return Err(Error::InvalidParameter(
                "receive_high_water_mark must be non-zero".into(),
            ));
        }

        Ok(SessionConfig {
            host,
            control_port,
            data_port,
            my_call_signs: self.my_call_signs.clone(),
            kind: self.kind,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            receive_high_water_mark,
            reconnect: self.reconnect.clone(),
        })
    }
}

/// A validated [`ListenConfig`], fixed for the lifetime of one `listen()`.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) host: String,
    pub(crate) control_port: u16,
    pub(crate) data_port: u16,
    pub(crate) my_call_signs: Vec<String>,
    pub(crate) kind: ModemKind,
    pub(crate) connect_timeout: Duration,
    pub(crate) receive_high_water_mark: usize,
    pub(crate) reconnect: ReconnectPolicy,
}
