//! Daemon Server Implementation
//!
//! This module provides the core server loop for the parley daemon:
//! - Binds every configured listener (TCP, Unix socket, WebSocket)
//! - Spawns one task per accepted connection that offers it to the matchmaker
//! - Tracks live connections and enforces the connection limit
//! - Supports graceful shutdown
//!
//! # Connection Flow
//!
//! ```text
//!    TcpAcceptor   UnixAcceptor   WebSocketAcceptor
//!         │              │                │
//!         └──────────────┼────────────────┘
//!                        │ mpsc<Connection>
//!                   DaemonServer ── limit check ── DashMap<ConnectionId, _>
//!                        │
//!          spawn: matchmaker.offer(conn), then wait for its close
//! ```
//!
//! A connection claimed by another offer stays tracked until the session
//! driving it closes it.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use parley_core::{Connection, ConnectionId, MatchOutcome, Matchmaker, Origin, TransportConfig};

#[cfg(unix)]
use crate::transport::UnixAcceptor;
#[cfg(feature = "websocket")]
use crate::transport::WebSocketAcceptor;
use crate::transport::{Acceptor, TcpAcceptor};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connection state tracking
struct ConnectionState {
    /// When the connection was accepted
    connected_at: Instant,
    /// Listener that accepted it
    transport: &'static str,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Accepted-connection queue between listeners and the server loop
    pub accept_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            accept_queue: 64,
        }
    }
}

impl From<&TransportConfig> for ServerConfig {
    fn from(transport: &TransportConfig) -> Self {
        Self {
            max_connections: transport.max_connections,
            ..Self::default()
        }
    }
}

/// Bind every listener enabled in `transport`
pub async fn bind_listeners(transport: &TransportConfig) -> Result<Vec<Box<dyn Acceptor>>> {
    let mut acceptors: Vec<Box<dyn Acceptor>> = Vec::new();

    if let Some(ref addr) = transport.tcp_addr {
        acceptors.push(Box::new(TcpAcceptor::bind(addr).await?));
    }

    if let Some(ref addr) = transport.websocket_addr {
        #[cfg(feature = "websocket")]
        acceptors.push(Box::new(WebSocketAcceptor::bind(addr).await?));
        #[cfg(not(feature = "websocket"))]
        warn!(addr = %addr, "WebSocket support not compiled in, listener skipped");
    }

    if let Some(ref path) = transport.unix_socket {
        #[cfg(unix)]
        acceptors.push(Box::new(UnixAcceptor::bind(path)?));
        #[cfg(not(unix))]
        warn!(path = ?path, "Unix sockets not supported on this platform, listener skipped");
    }

    if acceptors.is_empty() {
        anyhow::bail!("No listener could be started");
    }
    Ok(acceptors)
}

/// The main daemon server
pub struct DaemonServer {
    matchmaker: Matchmaker,
    server_config: ServerConfig,
    /// Socket file to remove on shutdown
    socket_path: Option<PathBuf>,
    /// Active connection state (task handles)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(matchmaker: Matchmaker, server_config: ServerConfig) -> Self {
        Self {
            matchmaker,
            server_config,
            socket_path: None,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Remove this socket file during shutdown
    #[must_use]
    pub fn with_socket_path(mut self, path: Option<PathBuf>) -> Self {
        self.socket_path = path;
        self
    }

    /// Run until `shutdown` resolves, then shut down gracefully
    pub async fn run<F>(&self, acceptors: Vec<Box<dyn Acceptor>>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (conn_tx, mut conn_rx) =
            mpsc::channel::<Connection>(self.server_config.accept_queue.max(1));

        let listener_tasks: Vec<JoinHandle<()>> = acceptors
            .into_iter()
            .map(|acceptor| {
                info!(
                    listener = acceptor.name(),
                    addr = %acceptor.local_addr(),
                    "Listener ready"
                );
                tokio::spawn(accept_loop(acceptor, conn_tx.clone()))
            })
            .collect();
        drop(conn_tx);

        tokio::pin!(shutdown);

        info!("Ready to accept connections");

        // Main accept loop
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                conn = conn_rx.recv() => {
                    let Some(conn) = conn else {
                        error!("All listeners stopped");
                        break;
                    };
                    self.admit(conn);
                }
            }
        }

        for task in &listener_tasks {
            task.abort();
        }

        self.shutdown();
        Ok(())
    }

    /// Track a new connection and hand it to the matchmaker
    fn admit(&self, mut conn: Connection) {
        let conn_id = conn.id();
        let transport = match conn.origin() {
            Origin::Human { transport } => transport,
            Origin::Bot => "bot",
        };

        // Check connection limit
        if self.connection_states.len() >= self.server_config.max_connections {
            warn!(
                conn_id = %conn_id,
                max_connections = self.server_config.max_connections,
                "Connection limit reached, rejecting new connection"
            );
            drop(conn);
            return;
        }

        info!(
            conn_id = %conn_id,
            transport,
            active_connections = self.connection_states.len() + 1,
            "New connection accepted"
        );

        let closed = conn.with_close_notify();
        let matchmaker = self.matchmaker.clone();
        let connection_states = Arc::clone(&self.connection_states);
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();

        let task_handle = tokio::spawn(
            async move {
                // Start only once tracked, so the removal below cannot race the insert
                if tracked_rx.await.is_err() {
                    return;
                }

                match matchmaker.offer(conn).await {
                    MatchOutcome::Claimed { by } => {
                        debug!(by = ?by.map(|id| id.to_string()), "Handed to partner's session");
                    }
                    MatchOutcome::Human(summary) | MatchOutcome::Bot(summary) => {
                        debug!(session_id = %summary.session_id, "Session finished");
                    }
                }

                // A claimed connection lives on in its partner's session
                let _ = closed.await;

                connection_states.remove(&conn_id);
                info!(
                    active_connections = connection_states.len(),
                    "Connection finished"
                );
            }
            .instrument(tracing::info_span!("connection", %conn_id, transport)),
        );

        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                transport,
                abort_handle: task_handle.abort_handle(),
            },
        );
        let _ = tracked_tx.send(());
    }

    /// Graceful shutdown
    fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        // Abort all connection handlers
        let conn_ids: Vec<ConnectionId> =
            self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                debug!(
                    conn_id = %conn_id,
                    transport = conn_state.transport,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        #[cfg(unix)]
        if let Some(ref path) = self.socket_path {
            crate::transport::unix::remove_socket_file(path);
        }

        let stats = self.matchmaker.stats();
        info!(
            offers = stats.offers,
            human_sessions = stats.human_sessions,
            bot_sessions = stats.bot_sessions,
            "Shutdown complete"
        );
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

/// Feed accepted connections from one listener into the server loop
async fn accept_loop(mut acceptor: Box<dyn Acceptor>, conn_tx: mpsc::Sender<Connection>) {
    let listener = acceptor.name();
    loop {
        match acceptor.accept().await {
            Ok(conn) => {
                if conn_tx.send(conn).await.is_err() {
                    debug!(listener, "Server loop gone, listener stopping");
                    break;
                }
            }
            Err(e) => {
                error!(listener, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
