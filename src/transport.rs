//! The stream transport a session runs over.
//!
//! Sessions only need an ordered, reliable byte stream, so they are generic over
//! `AsyncRead + AsyncWrite`. Listening is abstracted behind [`Accept`] so the accept loop can
//! be driven by something other than a bare `TcpListener`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A byte stream a session can own.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A listening endpoint that yields new connections.
pub trait Accept: Send + 'static {
    type Stream: ByteStream;

    /// Waits for the next connection. An error here is about one connection, not the
    /// endpoint; callers keep accepting.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Opens an outbound stream.
pub async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// An owned stream that can be closed any number of times.
///
/// The first [`close`](Connection::close) shuts down the write side and drops the stream;
/// later calls do nothing. Dropping an open `Connection` releases the stream as well.
#[derive(Debug)]
pub struct Connection<S> {
    stream: Option<S>,
}

impl<S: ByteStream> Connection<S> {
    pub fn new(stream: S) -> Connection<S> {
        Connection {
            stream: Some(stream),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Lends the stream out for a session. Returns `None` once closed.
    pub fn take(&mut self) -> Option<S> {
        self.stream.take()
    }

    /// Hands a lent stream back.
    pub fn restore(&mut self, stream: S) {
        self.stream = Some(stream);
    }

    /// Releases the stream. Returns `true` only for the call that actually closed it.
    pub async fn close(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                // The peer may already be gone; the stream is released either way.
                if let Err(err) = stream.shutdown().await {
                    tracing::debug!("shutdown on close: {}", err);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a);
        assert!(conn.is_open());
        assert!(conn.close().await);
        assert!(!conn.is_open());
        assert!(!conn.close().await);
        assert!(!conn.close().await);
    }

    #[tokio::test]
    async fn close_signals_eof_to_peer() {
        use tokio::io::AsyncReadExt;

        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a);
        conn.close().await;
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn take_and_restore() {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a);
        let stream = conn.take().unwrap();
        assert!(!conn.is_open());
        assert!(!conn.close().await);
        conn.restore(stream);
        assert!(conn.close().await);
    }
}
