//! Stream Tee
//!
//! [`TeeReader`] wraps a reader and copies every chunk it yields into a
//! [`TextSink`] on the way through. The relay wraps human read halves with it
//! so that chat text reaches the language model while being forwarded to the
//! partner.
//!
//! Sinks are infallible by signature: whatever happens on the ingestion side
//! cannot fail or stall the stream being observed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Second destination for bytes flowing through a [`TeeReader`]
pub trait TextSink: Send {
    /// Called with each chunk read from the wrapped stream
    fn observe(&mut self, bytes: &[u8]);

    /// Called once when the wrapped stream ends
    fn finish(&mut self);
}

/// Reader decorator that mirrors everything it reads into a sink
pub struct TeeReader<R, S> {
    inner: R,
    sink: S,
    finished: bool,
}

impl<R, S: TextSink> TeeReader<R, S> {
    /// Wrap `inner`, mirroring its bytes into `sink`
    pub fn new(inner: R, sink: S) -> Self {
        Self {
            inner,
            sink,
            finished: false,
        }
    }

    /// Finish the sink (if the stream has not ended yet) and unwrap the reader
    pub fn into_inner(mut self) -> R {
        self.finish_sink();
        self.inner
    }

    fn finish_sink(&mut self) {
        if !self.finished {
            self.finished = true;
            self.sink.finish();
        }
    }
}

impl<R, S> AsyncRead for TeeReader<R, S>
where
    R: AsyncRead + Unpin,
    S: TextSink + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    this.sink.observe(fresh);
                } else if had_room {
                    this.finish_sink();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.finish_sink();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
