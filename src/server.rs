//! Accepting connections and running a session for each.
//!
//! The accept loop never waits on a session: each one is spawned and left to finish on its
//! own, keeping itself in the [`ConnectionRegistry`] for as long as it lives. Shutdown is
//! requested through a [`ShutdownHandle`], which wakes the loop so it can drop the listener.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::registry::ConnectionRegistry;
use crate::session::{ConnectionId, DuplexPolicy, DuplexSession, SessionState};
use crate::terminal::{MessageSink, MessageSource};
use crate::transport::Accept;
use crate::DEFAULT_PORT;

/// First pause after a failed accept. Doubles while failures repeat.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// What happens to open sessions when the server stops accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Sessions keep running until their peer or operator ends them.
    #[default]
    Detach,
    /// Every open session is cancelled.
    CloseSessions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub shutdown: ShutdownPolicy,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            shutdown: ShutdownPolicy::Detach,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    running: AtomicBool,
    stop: CancellationToken,
}

/// Stops a running server. Cheap to clone and safe to use from any task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: Arc<ServerState>,
}

impl ShutdownHandle {
    /// Stops the accept loop. Only the first call has any effect; it returns `true`.
    pub fn shutdown(&self) -> bool {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.state.stop.cancel();
        info!("Server shutdown.");
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

/// A bound, listening server.
pub struct Server<L = TcpListener> {
    listener: L,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    state: Arc<ServerState>,
    policy: ShutdownPolicy,
}

impl Server<TcpListener> {
    /// Binds and listens on the configured address.
    pub async fn bind(config: &ServerConfig) -> Result<Server<TcpListener>, ServerError> {
        let addr = config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Server::with_listener(listener, config.shutdown)
    }
}

impl<L: Accept> Server<L> {
    /// Wraps an already listening endpoint.
    pub fn with_listener(listener: L, policy: ShutdownPolicy) -> Result<Server<L>, ServerError> {
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        info!("Server listening on {}", local_addr);
        Ok(Server {
            listener,
            local_addr,
            registry: ConnectionRegistry::new(),
            state: Arc::new(ServerState {
                running: AtomicBool::new(true),
                stop: CancellationToken::new(),
            }),
            policy,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: self.state.clone(),
        }
    }

    /// Accepts connections until shut down.
    ///
    /// Each session gets its own clone of `source` and shares `sink`. A failed accept is
    /// logged and retried after a pause that grows while failures repeat, since an error like
    /// EMFILE leaves the listener readable. On return the listener has been dropped, so new
    /// connections are refused.
    pub async fn run<I, K>(self, source: I, sink: Arc<K>)
    where
        I: MessageSource + Clone,
        K: MessageSink,
    {
        let Server {
            mut listener,
            registry,
            state,
            policy,
            ..
        } = self;

        let mut backoff = ACCEPT_BACKOFF_MIN;
        while state.running.load(Ordering::Acquire) {
            debug!("Waiting for client connections...");
            let accepted = tokio::select! {
                biased;
                _ = state.stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(err) => {
                    warn!("Error accepting client: {}; retrying in {:?}", err, backoff);
                    tokio::select! {
                        biased;
                        _ = state.stop.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };

            let session_state = SessionState::new(ConnectionId::next(), peer);
            info!("Client [{}] connected from {}", session_state.id(), peer);
            let Some(registration) = registry.register(session_state) else {
                warn!("Connection id already registered; dropping connection from {}", peer);
                continue;
            };
            let session = DuplexSession::registered(stream, registration, DuplexPolicy::SERVER);
            let source = source.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                session.run(source, sink.as_ref()).await;
            });
        }

        drop(listener);
        match policy {
            ShutdownPolicy::Detach => {
                let open = registry.len();
                if open > 0 {
                    info!("Stopped accepting; {} session(s) still open", open);
                }
            }
            ShutdownPolicy::CloseSessions => {
                registry.for_each(|session| {
                    session.cancel();
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_listens_everywhere_on_9999() {
        let config = ServerConfig::default();
        assert_eq!(config.addr(), "0.0.0.0:9999".parse::<SocketAddr>().unwrap());
        assert_eq!(config.shutdown, ShutdownPolicy::Detach);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".parse().unwrap(),
            port: taken.local_addr().unwrap().port(),
            shutdown: ShutdownPolicy::Detach,
        };
        match Server::bind(&config).await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, config.addr()),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bound a port that is already in use"),
        }
    }

    #[tokio::test]
    async fn shutdown_only_takes_effect_once() {
        let server = Server::bind(&ServerConfig {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            shutdown: ShutdownPolicy::Detach,
        })
        .await
        .unwrap();
        let handle = server.shutdown_handle();
        assert!(handle.is_running());
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(!handle.is_running());
    }
}
