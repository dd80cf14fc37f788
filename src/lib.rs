//! # A terminal chat server and client over raw TCP.
//!
//! The server accepts any number of clients and holds a live conversation with each: every
//! connection runs a receiver and a sender at the same time, so neither side has to wait for
//! the other to finish talking. The client is the same exchange over its one connection.
//!
//! Messages are unframed. Whatever one read returns is one message, and a message is written
//! exactly as typed. The only control signal is a terminator sent as a whole message:
//!
//! 1. `quit()` or `exit()` from a client closes that client's session on the server,
//! 2. `quit()` typed on the server closes the session it was sent on,
//! 3. `quit()` or `exit()` typed on the client is sent, then the client disconnects.
//!
//! A peer that simply disconnects ends its session the same way.
//!
//! Architecture:
//!
//! ```text
//!  TcpListener
//!     v
//! +-----------+  ChunkCodec  +-----------------------------+            +-------------------+
//! | TcpStream |<------------>| DuplexSession [receive|send]|--register->| ConnectionRegistry|
//! +-----------+              +-----------------------------+            +-------------------+
//! | TcpStream |<------------>| DuplexSession [receive|send]|--register->|                   |
//! +-----------+              +-----------------------------+            +-------------------+
//! | ...       |   ...        |  ...                        |
//! +-----------+              +-----------------------------+
//!                                 ^                 v
//!                           MessageSource      MessageSink
//!                             (Console)         (Printer)
//!                                 ^                 v
//!                               stdin             stdout
//! ```

pub mod client;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod terminal;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, ServerError};
pub use message::{ChunkCodec, Terminators, EXIT, QUIT};
pub use registry::{ConnectionRegistry, Registration};
pub use server::{Server, ServerConfig, ShutdownHandle, ShutdownPolicy};
pub use session::{CloseReason, ConnectionId, DuplexPolicy, DuplexSession, Liveness, SessionState};
pub use terminal::{
    ChannelSink, ChannelSource, Console, Delivery, MessageSink, MessageSource, PrintStyle, Printer,
};
pub use transport::{Accept, ByteStream, Connection};

/// Port used by both the server and the client when none is given.
pub const DEFAULT_PORT: u16 = 9999;
