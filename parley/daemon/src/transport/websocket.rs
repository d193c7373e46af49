//! WebSocket Listener
//!
//! Browser clients speak WebSocket; the core speaks bytes. Each accepted
//! socket is bridged onto an in-memory duplex pipe whose near end becomes the
//! [`Connection`]:
//!
//! ```text
//!   browser ◄──ws frames──► bridge task ◄──bytes──► duplex ◄──► Connection
//!             text/binary ──► bytes, one line per frame
//!             bytes ──► text frames (UTF-8 boundaries preserved)
//! ```
//!
//! The bridge ends as soon as either side closes; dropping its half of the
//! pipe delivers end-of-stream to the session.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use parley_core::{Connection, Origin};

use super::Acceptor;

/// Time allowed for the HTTP upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory pipe capacity between bridge and session
const BRIDGE_CAPACITY: usize = 16 * 1024;

/// Accepts WebSocket clients
pub struct WebSocketAcceptor {
    listener: TcpListener,
    addr: SocketAddr,
    handshakes: JoinSet<Result<Connection>>,
}

impl WebSocketAcceptor {
    /// Bind to `addr`
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener to {addr}"))?;
        let addr = listener
            .local_addr()
            .context("Failed to read WebSocket listener address")?;
        tracing::info!(addr = %addr, "Listening for WebSocket clients");
        Ok(Self {
            listener,
            addr,
            handshakes: JoinSet::new(),
        })
    }

    /// Bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Acceptor for WebSocketAcceptor {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn local_addr(&self) -> String {
        format!("ws://{}", self.addr())
    }

    async fn accept(&mut self) -> io::Result<Connection> {
        // Handshakes run concurrently so one slow client cannot stall others
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.handshakes.spawn(upgrade(stream, peer));
                }
                Some(done) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    match done {
                        Ok(Ok(conn)) => return Ok(conn),
                        Ok(Err(e)) => tracing::debug!(error = %e, "WebSocket handshake failed"),
                        Err(e) => tracing::warn!(error = %e, "WebSocket handshake task failed"),
                    }
                }
            }
        }
    }
}

async fn upgrade(stream: TcpStream, peer: SocketAddr) -> Result<Connection> {
    let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
        .await
        .with_context(|| format!("Handshake with {peer} timed out"))?
        .with_context(|| format!("Handshake with {peer} failed"))?;

    let (near, far) = tokio::io::duplex(BRIDGE_CAPACITY);
    let conn = Connection::new(near, Origin::human("websocket"));
    let conn_id = conn.id();
    tokio::spawn(async move {
        if let Err(e) = bridge(ws, far).await {
            tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket bridge ended with error");
        }
        tracing::debug!(conn_id = %conn_id, "WebSocket bridge closed");
    });

    tracing::debug!(conn_id = %conn_id, peer = %peer, "WebSocket client accepted");
    Ok(conn)
}

/// Pump frames to bytes and bytes to frames until either side closes
async fn bridge<S>(ws: WebSocketStream<S>, pipe: DuplexStream) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut pipe_rx, mut pipe_tx) = tokio::io::split(pipe);

    let inbound = async {
        while let Some(msg) = ws_rx.next().await {
            let payload = match msg? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            pipe_tx.write_all(&frame_line(payload)).await?;
            pipe_tx.flush().await?;
        }
        pipe_tx.shutdown().await?;
        Ok::<(), anyhow::Error>(())
    };

    let outbound = async {
        let mut buf = vec![0u8; 4096];
        let mut carry = Vec::new();
        loop {
            let n = pipe_rx.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            carry.extend_from_slice(&buf[..n]);
            let text = take_utf8(&mut carry);
            if !text.is_empty() {
                ws_tx.send(Message::Text(text)).await?;
            }
        }
        if !carry.is_empty() {
            ws_tx
                .send(Message::Text(String::from_utf8_lossy(&carry).into_owned()))
                .await?;
        }
        ws_tx.close().await?;
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        r = inbound => r,
        r = outbound => r,
    }
}

/// A frame is one chat message; end it with a newline so messages never
/// run together on the byte stream
fn frame_line(mut payload: Vec<u8>) -> Vec<u8> {
    if payload.last() != Some(&b'\n') {
        payload.push(b'\n');
    }
    payload
}

/// Drain the longest valid UTF-8 prefix of `buf` as text
///
/// An incomplete multi-byte sequence at the end stays in `buf` for the next
/// chunk. Invalid bytes elsewhere are replaced.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(text) => {
            let text = text.to_owned();
            buf.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let rest = buf.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(buf).into_owned();
            *buf = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{LanguageModel, ModelConfig};
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_take_utf8_keeps_split_sequence() {
        let snowman = "☃".as_bytes();
        let mut buf = b"hi ".to_vec();
        buf.extend_from_slice(&snowman[..1]);

        assert_eq!(take_utf8(&mut buf), "hi ");
        assert_eq!(buf, &snowman[..1]);

        buf.extend_from_slice(&snowman[1..]);
        assert_eq!(take_utf8(&mut buf), "☃");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_utf8_replaces_invalid_bytes() {
        let mut buf = vec![b'a', 0xff, b'b'];
        assert_eq!(take_utf8(&mut buf), "a\u{fffd}b");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_line_adds_single_newline() {
        assert_eq!(frame_line(b"hi".to_vec()), b"hi\n");
        assert_eq!(frame_line(b"hi\n".to_vec()), b"hi\n");
        assert_eq!(frame_line(Vec::new()), b"\n");
    }

    #[tokio::test]
    async fn test_frames_bridge_to_bytes() {
        let mut acceptor = WebSocketAcceptor::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", acceptor.addr());

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(url).await.unwrap();
            ws.send(Message::Text("how are".to_string())).await.unwrap();
            ws.send(Message::Binary(b"you today".to_vec())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
            reply
        });

        let mut conn = acceptor.accept().await.unwrap();
        assert_eq!(conn.origin(), Origin::human("websocket"));

        let expected = b"how are\nyou today\n";
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < expected.len() {
            let n = conn.recv(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);

        conn.send(b"hi there\n").await.unwrap();
        let reply = client.await.unwrap();
        assert_eq!(reply, Message::Text("hi there\n".to_string()));

        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_separate_frames_stay_separate_words() {
        let mut acceptor = WebSocketAcceptor::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", acceptor.addr());

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(url).await.unwrap();
            ws.send(Message::Text("how are".to_string())).await.unwrap();
            ws.send(Message::Text("you today".to_string())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut conn = acceptor.accept().await.unwrap();
        let model = LanguageModel::with_seed(&ModelConfig::default(), 1);
        let mut ingestor = model.ingestor();
        let mut buf = [0u8; 64];
        loop {
            let n = conn.recv(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            ingestor.feed(&buf[..n]);
        }
        ingestor.finish();
        client.await.unwrap();

        assert_eq!(
            model.sample_successor(&["how", "are"]).as_deref(),
            Some("you")
        );
        assert_eq!(model.sample_successor(&["how", "areyou"]), None);
    }
}
