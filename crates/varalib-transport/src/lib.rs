//! Socket factories for varalib.
//!
//! [`TcpConnector`] implements the [`Connector`](varalib_core::Connector)
//! trait from `varalib-core` over `tokio::net::TcpStream`. It is what
//! `Server::new()` uses to reach the modem's control and data ports.
//!
//! # Example
//!
//! ```no_run
//! use varalib_core::Connector;
//! use varalib_transport::TcpConnector;
//!
//! # async fn example() -> varalib_core::Result<()> {
//! let connector = TcpConnector::new();
//! let control = connector.connect("127.0.0.1", 8300).await?;
//! # drop(control);
//! # Ok(())
//! # }
//! ```

pub mod tcp;

pub use tcp::TcpConnector;
