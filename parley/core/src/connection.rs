//! Connections
//!
//! A [`Connection`] is an opaque duplex byte stream with an explicit close.
//! The transport layer (TCP, Unix socket, WebSocket bridge, in-process pipe)
//! builds one per accepted client and hands it to the matchmaker; everything
//! above this module is agnostic to where the bytes come from.
//!
//! # Lifecycle
//!
//! ```text
//!   transport ──► Connection::new ──► Matchmaker::offer ──► Relay::run
//!                                                               │
//!                                          Connection::close ◄──┘
//!                                                │
//!                                   close notifier fires (once)
//! ```
//!
//! `close` consumes the connection, so a connection can only be closed once.
//! Dropping a connection without closing it still releases the notifier.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

/// Any bidirectional async byte stream usable as a chat connection
pub trait ChatStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ChatStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Unique identifier for a connection
///
/// Allocated from a process-wide counter; stable for the lifetime of the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection's bytes originate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A person typing through some transport
    Human {
        /// Transport name, for logging ("tcp", "unix", "websocket", ...)
        transport: &'static str,
    },
    /// The synthetic Markov partner
    Bot,
}

impl Origin {
    /// Human connection over the given transport
    #[must_use]
    pub fn human(transport: &'static str) -> Self {
        Self::Human { transport }
    }

    /// Whether text from this origin should be learned by the model
    #[must_use]
    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human { .. })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human { transport } => write!(f, "human/{transport}"),
            Self::Bot => write!(f, "bot"),
        }
    }
}

/// A duplex chat stream with an explicit, exactly-once close
pub struct Connection {
    id: ConnectionId,
    origin: Origin,
    stream: Box<dyn ChatStream>,
    on_close: Option<oneshot::Sender<()>>,
}

impl Connection {
    /// Wrap a stream as a new connection
    pub fn new<S: ChatStream>(stream: S, origin: Origin) -> Self {
        Self {
            id: ConnectionId::new(),
            origin,
            stream: Box::new(stream),
            on_close: None,
        }
    }

    /// Create a connection backed by an in-memory pipe
    ///
    /// Returns the connection and the far end of the pipe. Whatever is
    /// written to the far end is read from the connection and vice versa.
    /// Used when embedding the core without a network transport, and in
    /// tests.
    #[must_use]
    pub fn in_process_pair(origin: Origin, capacity: usize) -> (Self, DuplexStream) {
        let (near, far) = tokio::io::duplex(capacity);
        (Self::new(near, origin), far)
    }

    /// Get a receiver that resolves once this connection is closed or dropped
    ///
    /// Resolves `Ok(())` after [`Connection::close`] and `Err(_)` if the
    /// connection is dropped unclosed; either way the waiter is released.
    /// Only one notifier exists per connection; calling this again replaces
    /// the previous one.
    pub fn with_close_notify(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.on_close = Some(tx);
        rx
    }

    /// Connection ID
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Origin of this connection's bytes
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Read whatever bytes are available; `Ok(0)` means end of stream
    pub async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf).await
    }

    /// Write a complete message to the stream and flush it
    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Split off the stream, keeping identity and notifier in a guard
    pub(crate) fn into_parts(self) -> (Box<dyn ChatStream>, CloseGuard) {
        let Self {
            id,
            origin,
            stream,
            on_close,
        } = self;
        (
            stream,
            CloseGuard {
                id,
                origin,
                on_close,
            },
        )
    }

    /// Flush, shut down and release the stream, then notify any waiter
    ///
    /// Errors from the shutdown are ignored: the peer may already be gone.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(conn_id = %self.id, error = %e, "Shutdown error ignored");
        }
        drop(self.stream);
        tracing::debug!(conn_id = %self.id, origin = %self.origin, "Connection closed");
        if let Some(tx) = self.on_close.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Identity and close notifier of a connection whose stream was split off
pub(crate) struct CloseGuard {
    id: ConnectionId,
    origin: Origin,
    on_close: Option<oneshot::Sender<()>>,
}

impl CloseGuard {
    /// Reassemble a connection from a stream and this guard
    pub(crate) fn rejoin(self, stream: Box<dyn ChatStream>) -> Connection {
        Connection {
            id: self.id,
            origin: self.origin,
            stream,
            on_close: self.on_close,
        }
    }
}
