//! Shared harness for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use duplex_chat::{
    Accept, ChannelSink, ChannelSource, ConnectionRegistry, Delivery, Server, ShutdownHandle,
    ShutdownPolicy,
};

pub const STEP: Duration = Duration::from_secs(5);

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// A server running in the background, with both of its local ends in the test's hands.
pub struct Harness {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub shutdown: ShutdownHandle,
    /// What the server operator "types".
    pub input: UnboundedSender<Bytes>,
    /// What the server receives from clients.
    pub received: UnboundedReceiver<Delivery>,
    pub task: JoinHandle<()>,
}

pub async fn start_server(policy: ShutdownPolicy) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    start_server_on(listener, policy)
}

pub fn start_server_on<L: Accept>(listener: L, policy: ShutdownPolicy) -> Harness {
    init_test_logging();
    let server = Server::with_listener(listener, policy).expect("listening address");
    let addr = server.local_addr();
    let registry = server.registry();
    let shutdown = server.shutdown_handle();
    let (input, source) = ChannelSource::new();
    let (sink, received) = ChannelSink::new();
    let task = tokio::spawn(server.run(source, Arc::new(sink)));
    Harness {
        addr,
        registry,
        shutdown,
        input,
        received,
        task,
    }
}

impl Harness {
    pub async fn next_delivery(&mut self) -> Delivery {
        tokio::time::timeout(STEP, self.received.next())
            .await
            .expect("no delivery in time")
            .expect("server sink closed")
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        let registry = self.registry.clone();
        eventually(move || registry.len() == count).await;
    }
}

/// Polls `check` until it holds, failing the test after [`STEP`].
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(STEP, fut).await {
        Ok(out) => out,
        Err(_) => panic!("{} timed out", what),
    }
}
