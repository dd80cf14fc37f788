//! Message units exchanged over a session.
//!
//! There is no wire format: whatever bytes one read returns are one message, and an outbound
//! message is written exactly as given. The only in-band control signal is a terminator token
//! sent as the entire payload.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Sent by either side to close the session gracefully.
pub const QUIT: &str = "quit()";
/// Alternate terminator accepted from clients.
pub const EXIT: &str = "exit()";

/// Capacity reserved for each read from a peer.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Returns true if `payload` is exactly one of `tokens`. Case-sensitive, no trimming.
pub fn is_terminator(payload: &[u8], tokens: &[&str]) -> bool {
    tokens.iter().any(|token| payload == token.as_bytes())
}

/// Which tokens end a session, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminators {
    /// Payloads from the peer that close the session.
    pub inbound: &'static [&'static str],
    /// Local input that closes the session. It is still transmitted so the peer sees it.
    pub outbound: &'static [&'static str],
}

impl Terminators {
    /// Accepted sessions: clients may send `quit()` or `exit()`, the operator types `quit()`.
    pub const SERVER: Terminators = Terminators {
        inbound: &[QUIT, EXIT],
        outbound: &[QUIT],
    };

    /// The client learns about a server-side close through EOF, so it watches no inbound token.
    pub const CLIENT: Terminators = Terminators {
        inbound: &[],
        outbound: &[QUIT, EXIT],
    };

    pub fn ends_inbound(&self, payload: &[u8]) -> bool {
        is_terminator(payload, self.inbound)
    }

    pub fn ends_outbound(&self, payload: &[u8]) -> bool {
        is_terminator(payload, self.outbound)
    }
}

/// Frames a byte stream as raw chunks.
///
/// Decoding yields everything buffered after a read as one message, so each receive is one
/// unit. Encoding copies the payload verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkCodec;

impl ChunkCodec {
    pub fn new() -> ChunkCodec {
        ChunkCodec
    }
}

impl Decoder for ChunkCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(buf.split().freeze()))
    }
}

impl Encoder<Bytes> for ChunkCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put(item);
        Ok(())
    }
}

/// Renders a payload for display. Invalid UTF-8 is replaced rather than rejected.
pub fn display(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
