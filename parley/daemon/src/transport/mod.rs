//! Listener Transports
//!
//! Each listener turns accepted sockets into human-origin
//! [`Connection`]s for the matchmaker:
//! - `tcp`: raw TCP, one byte stream per client (telnet / netcat friendly)
//! - `unix`: local Unix domain socket
//! - `websocket`: browser clients, frames bridged to a byte stream
//!   (feature `websocket`)
//!
//! The core never sees framing; everything arrives as plain bytes.

use std::io;

use async_trait::async_trait;
use parley_core::Connection;

pub mod tcp;
#[cfg(unix)]
pub mod unix;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::TcpAcceptor;
#[cfg(unix)]
pub use unix::UnixAcceptor;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketAcceptor;

/// A bound listener producing ready connections
#[async_trait]
pub trait Acceptor: Send {
    /// Transport name used in logs and connection origins
    fn name(&self) -> &'static str;

    /// Human-readable listen address
    fn local_addr(&self) -> String;

    /// Wait for the next client and wrap it as a connection
    ///
    /// Errors concern a single accept attempt; the listener stays usable.
    async fn accept(&mut self) -> io::Result<Connection>;
}
