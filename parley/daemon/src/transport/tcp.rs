//! Raw TCP listener

use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;

use parley_core::{Connection, Origin};

use super::Acceptor;

/// Accepts plain TCP clients
pub struct TcpAcceptor {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind to `addr` (e.g. `127.0.0.1:4001`, port 0 picks a free port)
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener to {addr}"))?;
        let addr = listener
            .local_addr()
            .context("Failed to read TCP listener address")?;
        tracing::info!(addr = %addr, "Listening for TCP clients");
        Ok(Self { listener, addr })
    }

    /// Bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> String {
        self.addr().to_string()
    }

    async fn accept(&mut self) -> io::Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let conn = Connection::new(stream, Origin::human("tcp"));
        tracing::debug!(conn_id = %conn.id(), peer = %peer, "TCP client accepted");
        Ok(conn)
    }
}
