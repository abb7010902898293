//! varalib-core: Core types, error definitions and the socket-factory trait
//! for varalib.
//!
//! This crate holds the pieces shared by every other varalib crate: the
//! protocol engine in `varalib`, the TCP socket factory in
//! `varalib-transport`, and the mocks in `varalib-test-harness`.
//! Applications normally reach these types through the `varalib` facade.
//!
//! # Key types
//!
//! - [`Connector`] -- opens byte streams to the modem's control and data ports
//! - [`ServerEvent`] -- asynchronous server notifications
//! - [`ConnectionState`] -- lifecycle of one logical radio link
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use varalib_core::*`.
pub use error::{Error, Result};
pub use events::{ListeningInfo, ServerEvent};
pub use transport::{BoxedStream, ByteStream, Connector};
pub use types::*;
