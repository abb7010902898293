//! CR line framing for the VARA control socket.
//!
//! Lines are delimited by a bare carriage return and decoded byte-for-byte
//! as Latin-1: every byte maps to exactly one `char`, nothing is replaced,
//! and encoding a decoded line reproduces the original bytes. The data
//! socket is not framed at all; its bytes are passed through unchanged.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use varalib_core::error::Error;

/// The carriage return that terminates every control line.
pub const CR: u8 = b'\r';

/// Maximum partial-line length before the buffer is discarded.
/// Control lines are typically 2–40 bytes; 8192 is generous headroom.
pub const MAX_LINE: usize = 8192;

/// Decoder and encoder for CR-terminated control lines.
///
/// Decoding yields lines without the delimiter; partial lines stay
/// buffered until the CR arrives. Encoding appends the CR.
#[derive(Debug, Default, Clone)]
pub struct LineCodec {
    /// Bytes already scanned for a CR in the current partial line.
    next_index: usize,
}

impl LineCodec {
    /// Create a codec with an empty partial-line state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Error> {
        let scan_from = self.next_index.min(buf.len());
        match buf[scan_from..].iter().position(|&b| b == CR) {
            Some(offset) => {
                let end = scan_from + offset;
                let line = buf.split_to(end + 1);
                self.next_index = 0;
                Ok(Some(latin1(&line[..end])))
            }
            None if buf.len() > MAX_LINE => {
                tracing::warn!(len = buf.len(), "control line too long, discarding");
                buf.clear();
                self.next_index = 0;
                Ok(None)
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Error> {
        let line = line.as_ref();
        dst.reserve(line.len() + 1);
        for ch in line.chars() {
            match u8::try_from(ch) {
                Ok(b) => dst.put_u8(b),
                Err(_) => {
                    let mut utf8 = [0u8; 4];
                    dst.put_slice(ch.encode_utf8(&mut utf8).as_bytes());
                }
            }
        }
        dst.put_u8(CR);
        Ok(())
    }
}

/// Decode bytes as Latin-1, one `char` per byte.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
