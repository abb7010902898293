//! # varalib -- Async client for the VARA soundmodem
//!
//! `varalib` talks to a running VARA HF or VARA FM modem over its two TCP
//! sockets and exposes inbound radio links as byte-stream connections, the
//! way a TCP server exposes accepted sockets. It is intended for BBS,
//! Winlink-style gateway and messaging software that wants to answer
//! calls over the air.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! varalib = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Listen on a modem and greet every station that connects:
//!
//! ```no_run
//! use varalib::{ListenConfig, Server, ServerEvent};
//!
//! #[tokio::main]
//! async fn main() -> varalib::Result<()> {
//!     let mut server = Server::new();
//!     let mut events = server.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let ServerEvent::Error(e) = event {
//!                 eprintln!("modem error: {e}");
//!             }
//!         }
//!     });
//!
//!     server.listen(
//!         ListenConfig::new()
//!             .host("127.0.0.1")
//!             .control_port(8300)
//!             .my_call("N0CALL"),
//!     )?;
//!
//!     while let Some(mut conn) = server.accept().await {
//!         println!("link from {}", conn.remote_call_sign());
//!         conn.write(b"Welcome\r").await?;
//!         conn.end().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                  | Purpose                                          |
//! |------------------------|--------------------------------------------------|
//! | `varalib-core`         | Errors, events, shared types, [`Connector`] trait |
//! | `varalib-protocol`     | Control-line codec, status parsing, command queue |
//! | `varalib-transport`    | [`TcpConnector`] over `tokio::net::TcpStream`    |
//! | **`varalib`**          | This crate: [`Server`], [`Connection`], config   |
//!
//! Each listening [`Server`] runs a single tokio task that owns the control
//! socket, the data socket and all protocol state. Handles talk to it over
//! channels, so a [`Server`] and its [`Connection`]s can be used from any
//! task.
//!
//! ## Lifecycle
//!
//! 1. [`Server::listen`] connects the control port and registers the call
//!    signs (`VERSION`, `MYCALL`, `LISTEN ON`). [`ServerEvent::Listening`]
//!    follows once the modem accepts.
//! 2. When a station calls, the modem reports `PENDING` and then
//!    `CONNECTED`; the data port is opened and a [`Connection`] is handed
//!    out by [`Server::accept`].
//! 3. [`Connection::end`] waits for the modem's transmit buffer to drain
//!    before dropping the link; [`Connection::destroy`] drops it at once.
//! 4. If the control socket is lost, the server reconnects according to
//!    its [`ReconnectPolicy`] until [`Server::close`] is called.

mod config;
mod connection;
mod server;
mod session;

pub use varalib_core::*;

pub use config::{ListenConfig, ReconnectPolicy};
pub use connection::{Connection, ConnectionEvent};
pub use server::Server;
pub use varalib_protocol::summarize;
pub use varalib_transport::TcpConnector;
