//! Control-channel protocol for VARA modems.
//!
//! VARA's control port carries CR-terminated ASCII lines with
//! case-insensitive keywords. This crate is free of I/O: it turns bytes
//! into lines and lines into typed status notices, and sequences outgoing
//! commands so that at most one is awaiting its reply at any time. The
//! session task in `varalib` drives it.
//!
//! # Architecture
//!
//! - [`codec`] -- CR line framing for the control socket
//! - [`protocol`] -- status-line parsing, outgoing commands, data summaries
//! - [`queue`] -- the request/reply command sequencer

pub mod codec;
pub mod protocol;
pub mod queue;

pub use codec::LineCodec;
pub use protocol::{Command, Notice, ProtocolLine, summarize};
pub use queue::{Advance, CommandQueue, Rejection};
