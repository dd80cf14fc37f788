//! The local ends of a session: where outgoing messages come from and where incoming ones go.
//!
//! A session's sender pulls from a [`MessageSource`], its receiver pushes into a
//! [`MessageSink`]. The interactive binary uses [`Console`] and [`Printer`]; the channel
//! variants let a program (or a test) drive sessions directly.

use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use tokio::io::{AsyncRead, Stdin};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::session::ConnectionId;

/// Longest line accepted from the console.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Supplies outgoing messages. `Ok(None)` means there will be no more.
///
/// `next_message` must be cancel safe: a session drops the pending call when it closes.
pub trait MessageSource: Send + 'static {
    fn next_message(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Receives every inbound message of a session.
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, id: ConnectionId, payload: &Bytes);
}

/// Lines typed on stdin, without their line endings.
///
/// Clones share one reader: with several sessions open, each line goes to whichever session
/// asks first. A line longer than the limit is reported and skipped; reading resumes after
/// its newline.
#[derive(Debug)]
pub struct Console<R = Stdin> {
    lines: Arc<Mutex<FramedRead<R, ConsoleLines>>>,
}

impl<R> Clone for Console<R> {
    fn clone(&self) -> Self {
        Console {
            lines: self.lines.clone(),
        }
    }
}

impl Console {
    pub fn new() -> Console {
        Console::from_reader(tokio::io::stdin(), MAX_LINE_LENGTH)
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::new()
    }
}

impl<R: AsyncRead + Send + Unpin + 'static> Console<R> {
    /// Reads lines from any byte source, skipping lines longer than `max_line_length`.
    pub fn from_reader(reader: R, max_line_length: usize) -> Console<R> {
        let codec = ConsoleLines(LinesCodec::new_with_max_length(max_line_length));
        Console {
            lines: Arc::new(Mutex::new(FramedRead::new(reader, codec))),
        }
    }
}

impl<R: AsyncRead + Send + Unpin + 'static> MessageSource for Console<R> {
    async fn next_message(&mut self) -> io::Result<Option<Bytes>> {
        match self.lines.lock().await.next().await {
            Some(Ok(line)) => Ok(Some(Bytes::from(line))),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

/// `LinesCodec` that drops an overlong line instead of failing the stream. `FramedRead`
/// ends a stream once on any decode error, which would read as end of input.
#[derive(Debug)]
struct ConsoleLines(LinesCodec);

impl ConsoleLines {
    fn skip_long(
        &mut self,
        buf: &mut BytesMut,
        decode: fn(&mut LinesCodec, &mut BytesMut) -> Result<Option<String>, LinesCodecError>,
    ) -> io::Result<Option<String>> {
        loop {
            match decode(&mut self.0, buf) {
                Ok(line) => return Ok(line),
                // The codec is now discarding up to the next newline; decoding again resumes
                // after it.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        "Input line longer than {} bytes, not sent.",
                        self.0.max_length()
                    );
                }
                Err(LinesCodecError::Io(err)) => return Err(err),
            }
        }
    }
}

impl Decoder for ConsoleLines {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        self.skip_long(buf, LinesCodec::decode)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        self.skip_long(buf, LinesCodec::decode_eof)
    }
}

/// Messages pushed through an unbounded channel.
///
/// Clones share the receiving end, like [`Console`].
#[derive(Debug, Clone)]
pub struct ChannelSource {
    rx: Arc<Mutex<UnboundedReceiver<Bytes>>>,
}

impl ChannelSource {
    /// Returns the sender to feed messages in and the source to hand to a session. Dropping
    /// every sender ends the source.
    pub fn new() -> (UnboundedSender<Bytes>, ChannelSource) {
        let (tx, rx) = mpsc::unbounded();
        (
            tx,
            ChannelSource {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

impl MessageSource for ChannelSource {
    async fn next_message(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.lock().await.next().await)
    }
}

/// How [`Printer`] labels a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStyle {
    /// `Client [<id>]: <text>`, for a server talking to many peers.
    Tagged,
    /// The text alone, for a client with a single peer.
    Bare,
}

/// Writes inbound messages to stdout.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    style: PrintStyle,
}

impl Printer {
    pub fn new(style: PrintStyle) -> Printer {
        Printer { style }
    }
}

impl MessageSink for Printer {
    fn deliver(&self, id: ConnectionId, payload: &Bytes) {
        let text = crate::message::display(payload);
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let written = match self.style {
            PrintStyle::Tagged => writeln!(out, "Client [{}]: {}", id, text),
            PrintStyle::Bare => writeln!(out, "{}", text),
        };
        if let Err(err) = written.and_then(|()| out.flush()) {
            debug!("[{}] failed to print message: {}", id, err);
        }
    }
}

/// One inbound message, as forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: ConnectionId,
    pub payload: Bytes,
}

/// Forwards inbound messages over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<Delivery>,
}

impl ChannelSink {
    pub fn new() -> (ChannelSink, UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded();
        (ChannelSink { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&self, id: ConnectionId, payload: &Bytes) {
        // Nobody listening is not the session's problem.
        let _ = self.tx.unbounded_send(Delivery {
            id,
            payload: payload.clone(),
        });
    }
}
