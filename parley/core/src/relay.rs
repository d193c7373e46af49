//! Session Relay
//!
//! [`Relay::run`] turns two connections into a chat session: it greets both
//! sides, then copies bytes in both directions until either direction ends,
//! and finally closes both connections exactly once.
//!
//! # Session Lifecycle
//!
//! ```text
//!   greet a, greet b
//!         │
//!         ├──► task a→b: read a ──(tee → model if a is human)──► write b
//!         └──► task b→a: read b ──(tee → model if b is human)──► write a
//!                         │
//!        first task ends ─┴─► stop signal ─► other task returns its halves
//!                                                 │
//!                               reunite halves, close a, close b
//! ```
//!
//! Errors never escape a session. They are logged inside the session span
//! and reported in the returned [`SessionSummary`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::connection::{ChatStream, Connection, ConnectionId};
use crate::markov::LanguageModel;
use crate::tee::{TeeReader, TextSink};

/// Unique identifier for a chat session, displayed `session-N`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a new unique session ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One of the two copy directions of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from `a`, written to `b`
    AToB,
    /// Bytes read from `b`, written to `a`
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AToB => write!(f, "a->b"),
            Self::BToA => write!(f, "b->a"),
        }
    }
}

/// Why a session ended abnormally
#[derive(Debug, Error)]
pub enum SessionError {
    /// The greeting could not be delivered
    #[error("greeting to {conn_id} failed: {source}")]
    Greeting {
        /// Connection that could not be greeted
        conn_id: ConnectionId,
        /// Underlying IO error
        source: io::Error,
    },

    /// Reading or writing failed while copying
    #[error("copy {direction} failed: {source}")]
    Copy {
        /// Direction that failed
        direction: Direction,
        /// Underlying IO error
        source: io::Error,
    },

    /// A direction task panicked or was cancelled
    #[error("relay task failed: {0}")]
    Task(#[from] JoinError),
}

impl SessionError {
    /// IO error kind, when the failure came from IO
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Greeting { source, .. } | Self::Copy { source, .. } => Some(source.kind()),
            Self::Task(_) => None,
        }
    }
}

/// What happened during one session
#[derive(Debug)]
pub struct SessionSummary {
    /// Session identifier
    pub session_id: SessionId,
    /// First connection passed to [`Relay::run`]
    pub a: ConnectionId,
    /// Second connection passed to [`Relay::run`]
    pub b: ConnectionId,
    /// Direction whose end terminated the session (None if it never started)
    pub ended_by: Option<Direction>,
    /// First error observed, if any
    pub error: Option<SessionError>,
    /// Payload bytes relayed from `a` to `b` (greeting excluded)
    pub bytes_a_to_b: u64,
    /// Payload bytes relayed from `b` to `a` (greeting excluded)
    pub bytes_b_to_a: u64,
    /// Wall time from greeting to teardown
    pub duration: Duration,
}

/// How a single copy direction finished
#[derive(Debug)]
enum CopyEnd {
    Eof,
    Stopped,
    Failed(io::Error),
}

type Reader = ReadHalf<Box<dyn ChatStream>>;
type Writer = WriteHalf<Box<dyn ChatStream>>;

/// Everything a direction task hands back when it ends
struct DirectionOutcome {
    reader: Reader,
    writer: Writer,
    bytes: u64,
    end: CopyEnd,
}

/// Bidirectional relay between two connections
#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    model: LanguageModel,
}

impl Relay {
    /// Create a relay feeding human text into `model`
    #[must_use]
    pub fn new(config: RelayConfig, model: LanguageModel) -> Self {
        Self { config, model }
    }

    /// Run a session between `a` and `b` to completion
    ///
    /// Both connections are closed before this returns, on every path.
    pub async fn run(&self, a: Connection, b: Connection) -> SessionSummary {
        let session_id = SessionId::new();
        let span = tracing::info_span!(
            "session",
            session_id = %session_id,
            a = %a.id(),
            b = %b.id(),
        );
        self.run_session(session_id, a, b).instrument(span).await
    }

    async fn run_session(
        &self,
        session_id: SessionId,
        mut a: Connection,
        mut b: Connection,
    ) -> SessionSummary {
        let started = Instant::now();
        let mut summary = SessionSummary {
            session_id,
            a: a.id(),
            b: b.id(),
            ended_by: None,
            error: None,
            bytes_a_to_b: 0,
            bytes_b_to_a: 0,
            duration: Duration::ZERO,
        };

        tracing::info!(origin_a = %a.origin(), origin_b = %b.origin(), "Session started");

        let greeting = self.config.greeting.as_bytes();
        let greeted = match a.send(greeting).await {
            Ok(()) => b.send(greeting).await.map_err(|e| (b.id(), e)),
            Err(e) => Err((a.id(), e)),
        };
        if let Err((conn_id, source)) = greeted {
            let err = SessionError::Greeting { conn_id, source };
            tracing::warn!(error = %err, "Session aborted");
            summary.error = Some(err);
            tokio::join!(a.close(), b.close());
            summary.duration = started.elapsed();
            return summary;
        }

        let sink_a = a.origin().is_human().then(|| self.model.ingestor());
        let sink_b = b.origin().is_human().then(|| self.model.ingestor());

        let (a_stream, a_guard) = a.into_parts();
        let (b_stream, b_guard) = b.into_parts();
        let (a_read, a_write) = tokio::io::split(a_stream);
        let (b_read, b_write) = tokio::io::split(b_stream);

        let (stop_tx, stop_rx) = watch::channel(false);
        let buffer_size = self.config.buffer_size.max(1);

        let mut a_to_b = tokio::spawn(
            run_direction(a_read, b_write, sink_a, buffer_size, stop_rx.clone())
                .in_current_span(),
        );
        let mut b_to_a = tokio::spawn(
            run_direction(b_read, a_write, sink_b, buffer_size, stop_rx).in_current_span(),
        );

        let (first, first_result) = tokio::select! {
            r = &mut a_to_b => (Direction::AToB, r),
            r = &mut b_to_a => (Direction::BToA, r),
        };
        let _ = stop_tx.send(true);
        let second_result = match first {
            Direction::AToB => b_to_a.await,
            Direction::BToA => a_to_b.await,
        };
        summary.ended_by = Some(first);

        let (ab, ba) = match first {
            Direction::AToB => (first_result, second_result),
            Direction::BToA => (second_result, first_result),
        };

        match (ab, ba) {
            (Ok(ab), Ok(ba)) => {
                summary.bytes_a_to_b = ab.bytes;
                summary.bytes_b_to_a = ba.bytes;
                summary.error = first_copy_error(first, ab.end, ba.end);

                let a = a_guard.rejoin(ab.reader.unsplit(ba.writer));
                let b = b_guard.rejoin(ba.reader.unsplit(ab.writer));
                tokio::join!(a.close(), b.close());
            }
            // Halves held by a failed task are gone; dropping the guards
            // still releases anyone waiting on either connection.
            (Err(e), _) | (_, Err(e)) => {
                summary.error = Some(SessionError::Task(e));
            }
        }

        summary.duration = started.elapsed();
        match &summary.error {
            Some(err) => tracing::warn!(
                error = %err,
                ended_by = ?summary.ended_by,
                "Session ended with error"
            ),
            None => tracing::info!(
                ended_by = ?summary.ended_by,
                bytes_a_to_b = summary.bytes_a_to_b,
                bytes_b_to_a = summary.bytes_b_to_a,
                duration_ms = summary.duration.as_millis() as u64,
                "Session ended"
            ),
        }
        summary
    }
}

fn first_copy_error(first: Direction, ab: CopyEnd, ba: CopyEnd) -> Option<SessionError> {
    let ordered = match first {
        Direction::AToB => [(Direction::AToB, ab), (Direction::BToA, ba)],
        Direction::BToA => [(Direction::BToA, ba), (Direction::AToB, ab)],
    };
    ordered.into_iter().find_map(|(direction, end)| match end {
        CopyEnd::Failed(source) => Some(SessionError::Copy { direction, source }),
        CopyEnd::Eof | CopyEnd::Stopped => None,
    })
}

async fn run_direction<S>(
    reader: Reader,
    mut writer: Writer,
    sink: Option<S>,
    buffer_size: usize,
    mut stop: watch::Receiver<bool>,
) -> DirectionOutcome
where
    S: TextSink + Unpin,
{
    let mut bytes = 0u64;
    let (reader, end) = match sink {
        Some(sink) => {
            let mut tee = TeeReader::new(reader, sink);
            let end = copy_until_stopped(&mut tee, &mut writer, buffer_size, &mut stop, &mut bytes)
                .await;
            (tee.into_inner(), end)
        }
        None => {
            let mut reader = reader;
            let end =
                copy_until_stopped(&mut reader, &mut writer, buffer_size, &mut stop, &mut bytes)
                    .await;
            (reader, end)
        }
    };

    match &end {
        CopyEnd::Eof => tracing::debug!(bytes, "Direction reached end of stream"),
        CopyEnd::Stopped => tracing::trace!(bytes, "Direction stopped"),
        CopyEnd::Failed(e) => tracing::debug!(bytes, error = %e, "Direction failed"),
    }

    DirectionOutcome {
        reader,
        writer,
        bytes,
        end,
    }
}

async fn copy_until_stopped<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    stop: &mut watch::Receiver<bool>,
    bytes: &mut u64,
) -> CopyEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return CopyEnd::Stopped,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return CopyEnd::Eof,
                Ok(n) => n,
                Err(e) => return CopyEnd::Failed(e),
            },
        };

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return CopyEnd::Stopped,
            written = write => {
                if let Err(e) = written {
                    return CopyEnd::Failed(e);
                }
            }
        }
        *bytes += n as u64;
    }
}
