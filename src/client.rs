//! The single-connection side: connect, talk, close.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::info;

use crate::error::ClientError;
use crate::session::{self, CloseReason, ConnectionId, DuplexPolicy, SessionState};
use crate::terminal::{MessageSink, MessageSource};
use crate::transport::{self, Connection};
use crate::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl ClientConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }
}

/// One outbound connection. Unlike the server there is no registry: the client owns its
/// only session outright.
#[derive(Debug)]
pub struct Client {
    state: Arc<SessionState>,
    connection: Connection<TcpStream>,
}

impl Client {
    pub async fn connect(config: &ClientConfig) -> Result<Client, ClientError> {
        let addr = config.addr();
        let stream = transport::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        info!("Connected to server.");
        Ok(Client {
            state: SessionState::new(ConnectionId::next(), addr),
            connection: Connection::new(stream),
        })
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection
            .get_ref()
            .and_then(|stream| stream.local_addr().ok())
    }

    /// Sends from `source` and delivers to `sink` until either side ends the session.
    pub async fn communicate<I, K>(&mut self, source: I, sink: &K) -> Result<CloseReason, ClientError>
    where
        I: MessageSource,
        K: MessageSink + ?Sized,
    {
        let stream = self.connection.take().ok_or(ClientError::NotConnected)?;
        let (stream, reason) =
            session::exchange(stream, &self.state, DuplexPolicy::CLIENT, source, sink).await;
        self.connection.restore(stream);
        Ok(reason)
    }

    /// Closes the connection. Safe to call repeatedly; only the first call does anything.
    pub async fn close(&mut self) -> bool {
        if !self.connection.close().await {
            return false;
        }
        self.state.mark_closed();
        info!("Connection closed.");
        true
    }
}
