//! varalib-test-harness: mock sockets and a scripted modem for varalib.
//!
//! [`MockConnector`] implements the [`Connector`](varalib_core::Connector)
//! trait over in-memory pipes, so the protocol engine can be driven line by
//! line without a running modem. [`MockTcpModem`] binds real control and
//! data listeners for end-to-end tests through `TcpConnector`. Both hand
//! their accepted sockets to the test as [`MockPeer`]s.

pub mod mock_connector;
pub mod mock_tcp;

pub use mock_connector::{ConnectBehavior, MockConnector, MockPeer, MockPeers};
pub use mock_tcp::MockTcpModem;
