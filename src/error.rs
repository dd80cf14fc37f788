//! Errors that escape a server or client.
//!
//! Per-session transport failures are not here: they end the session with a
//! [`CloseReason`](crate::session::CloseReason) and never reach the caller.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal setup failures. A server that cannot listen has nothing to run.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read listening address: {0}")]
    LocalAddr(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("couldn't connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connection already closed")]
    NotConnected,
}
