//! One connection's two-way exchange.
//!
//! A session runs a receiver and a sender concurrently over the same stream, so either side
//! may talk without waiting for the other. Both watch one [`SessionState`]: whichever unit
//! detects the end first moves it to `Closing` and cancels its token, which wakes the other
//! unit out of whatever it is waiting on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::{ChunkCodec, Terminators, READ_BUFFER_SIZE};
use crate::registry::Registration;
use crate::terminal::{MessageSink, MessageSource};
use crate::transport::{ByteStream, Connection};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique label for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> ConnectionId {
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle. Moves forward only: `Active` → `Closing` → `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl Liveness {
    fn from_u8(raw: u8) -> Liveness {
        match raw {
            0 => Liveness::Active,
            1 => Liveness::Closing,
            _ => Liveness::Closed,
        }
    }
}

/// Why a session ended. Recorded by whichever unit noticed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a terminator token.
    PeerTerminator,
    /// The peer closed its write side.
    PeerEof,
    /// Reading from the peer failed.
    ReceiveError,
    /// Local input was a terminator token.
    LocalTerminator,
    /// Writing to the peer failed.
    SendError,
    /// Local input ran out.
    InputClosed,
    /// Reading local input failed.
    InputError,
    /// Closed from outside the session, e.g. by server shutdown.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::PeerTerminator => "peer requested close",
            CloseReason::PeerEof => "peer disconnected",
            CloseReason::ReceiveError => "receive failed",
            CloseReason::LocalTerminator => "closed locally",
            CloseReason::SendError => "send failed",
            CloseReason::InputClosed => "input ended",
            CloseReason::InputError => "input failed",
            CloseReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Shared view of one session: identity, liveness and the wake-up token.
///
/// The session owns the stream; everything else (the registry, the server on shutdown) only
/// holds this.
#[derive(Debug)]
pub struct SessionState {
    id: ConnectionId,
    peer: SocketAddr,
    liveness: AtomicU8,
    reason: OnceLock<CloseReason>,
    done: CancellationToken,
}

impl SessionState {
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Arc<SessionState> {
        Arc::new(SessionState {
            id,
            peer,
            liveness: AtomicU8::new(Liveness::Active as u8),
            reason: OnceLock::new(),
            done: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.liveness() == Liveness::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Moves `Active` to `Closing` and wakes both units. Returns `true` for the caller that
    /// made the transition; later callers change nothing.
    pub fn begin_closing(&self, reason: CloseReason) -> bool {
        let first = self
            .liveness
            .compare_exchange(
                Liveness::Active as u8,
                Liveness::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if first {
            let _ = self.reason.set(reason);
        }
        self.done.cancel();
        first
    }

    /// Asks a running session to wind down.
    pub fn cancel(&self) -> bool {
        self.begin_closing(CloseReason::Cancelled)
    }

    /// Resolves once the session has left `Active`.
    pub async fn closing(&self) {
        self.done.cancelled().await
    }

    pub(crate) fn mark_closed(&self) {
        self.liveness.store(Liveness::Closed as u8, Ordering::Release);
        self.done.cancel();
    }
}

/// Per-role behaviour of the two units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexPolicy {
    pub terminators: Terminators,
    /// Close the whole session when local input runs out, instead of only stopping the sender.
    pub close_on_input_end: bool,
}

impl DuplexPolicy {
    pub const SERVER: DuplexPolicy = DuplexPolicy {
        terminators: Terminators::SERVER,
        close_on_input_end: false,
    };

    pub const CLIENT: DuplexPolicy = DuplexPolicy {
        terminators: Terminators::CLIENT,
        close_on_input_end: true,
    };
}

/// Runs the receiver and sender over `stream` until both have stopped, then hands the stream
/// back.
pub(crate) async fn exchange<S, I, K>(
    stream: S,
    state: &SessionState,
    policy: DuplexPolicy,
    source: I,
    sink: &K,
) -> (S, CloseReason)
where
    S: ByteStream,
    I: MessageSource,
    K: MessageSink + ?Sized,
{
    let (reader, writer) = tokio::io::split(stream);
    let (reader, writer) = tokio::join!(
        receive(reader, state, &policy.terminators, sink),
        send(writer, state, policy, source),
    );
    // Nothing reaches here without someone having left Active, except a bare mark_closed.
    let reason = state.close_reason().unwrap_or(CloseReason::Cancelled);
    (reader.unsplit(writer), reason)
}

async fn receive<R, K>(reader: R, state: &SessionState, terminators: &Terminators, sink: &K) -> R
where
    R: AsyncRead + Unpin,
    K: MessageSink + ?Sized,
{
    let id = state.id();
    let mut frames = FramedRead::with_capacity(reader, ChunkCodec::new(), READ_BUFFER_SIZE);
    loop {
        let next = tokio::select! {
            biased;
            _ = state.done.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(payload)) => {
                debug!("[{}] received {} bytes", id, payload.len());
                sink.deliver(id, &payload);
                if terminators.ends_inbound(&payload) {
                    info!("Client [{}] requested to close the connection.", id);
                    state.begin_closing(CloseReason::PeerTerminator);
                    break;
                }
            }
            None => {
                info!("Client [{}] disconnected.", id);
                state.begin_closing(CloseReason::PeerEof);
                break;
            }
            Some(Err(err)) => {
                warn!("Error reading from client [{}]: {}", id, err);
                state.begin_closing(CloseReason::ReceiveError);
                break;
            }
        }
    }
    frames.into_inner()
}

async fn send<W, I>(writer: W, state: &SessionState, policy: DuplexPolicy, mut source: I) -> W
where
    W: AsyncWrite + Unpin,
    I: MessageSource,
{
    let id = state.id();
    let mut frames = FramedWrite::new(writer, ChunkCodec::new());
    loop {
        let next = tokio::select! {
            biased;
            _ = state.done.cancelled() => break,
            next = source.next_message() => next,
        };
        let payload = match next {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                if policy.close_on_input_end {
                    state.begin_closing(CloseReason::InputClosed);
                } else {
                    debug!("[{}] input ended, still receiving", id);
                }
                break;
            }
            Err(err) => {
                warn!("[{}] failed to read input: {}", id, err);
                if policy.close_on_input_end {
                    state.begin_closing(CloseReason::InputError);
                }
                break;
            }
        };
        if !state.is_active() {
            break;
        }
        if payload.is_empty() {
            warn!("Empty message not sent.");
            continue;
        }

        let last = policy.terminators.ends_outbound(&payload);
        if last {
            info!("Closing connection [{}].", id);
            state.begin_closing(CloseReason::LocalTerminator);
        }
        if let Err(err) = frames.send(payload).await {
            warn!("Failed to send message to client [{}]: {}", id, err);
            state.begin_closing(CloseReason::SendError);
            break;
        }
        if last {
            break;
        }
    }
    frames.into_inner()
}

/// Owns one connection for as long as its exchange lasts.
///
/// `run` releases everything on the way out: the connection is closed once, the session is
/// marked `Closed` and, for registered sessions, its registry entry is removed.
pub struct DuplexSession<S> {
    state: Arc<SessionState>,
    connection: Connection<S>,
    registration: Option<Registration>,
    policy: DuplexPolicy,
}

impl<S: ByteStream> DuplexSession<S> {
    pub fn new(stream: S, state: Arc<SessionState>, policy: DuplexPolicy) -> DuplexSession<S> {
        DuplexSession {
            state,
            connection: Connection::new(stream),
            registration: None,
            policy,
        }
    }

    /// A session that leaves the registry when it ends.
    pub fn registered(stream: S, registration: Registration, policy: DuplexPolicy) -> DuplexSession<S> {
        DuplexSession {
            state: registration.state().clone(),
            connection: Connection::new(stream),
            registration: Some(registration),
            policy,
        }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub async fn run<I, K>(mut self, source: I, sink: &K) -> CloseReason
    where
        I: MessageSource,
        K: MessageSink + ?Sized,
    {
        let reason = match self.connection.take() {
            Some(stream) => {
                let (stream, reason) = exchange(stream, &self.state, self.policy, source, sink).await;
                self.connection.restore(stream);
                reason
            }
            None => CloseReason::Cancelled,
        };
        self.connection.close().await;
        match self.registration.take() {
            Some(registration) => registration.release(),
            None => self.state.mark_closed(),
        }
        info!("Client [{}] session closed: {}", self.state.id(), reason);
        reason
    }
}
