//! Markov Bot
//!
//! [`Bot`] is a synthetic chat partner that behaves like any other
//! connection stream. Whatever its partner writes into it is consumed
//! immediately; each write schedules one reply task that waits for the
//! configured "thinking" delay, generates up to `max_words` words from the
//! shared [`LanguageModel`], and pushes the reply onto the bot's outbound
//! side.
//!
//! # Reply Flow
//!
//! ```text
//!   poll_write("hi") ──► spawn ──► sleep(reply_delay) ──► model.generate()
//!                                                               │
//!   poll_read() ◄────────── unbounded channel ◄──── "reply words\n"
//! ```
//!
//! Each reply is delivered whole. Overlapping replies are delivered in the
//! order they complete. At most `max_pending_replies` replies wait out their
//! delay at once; input arriving beyond that is consumed silently. The bot never reports errors to its partner: an
//! empty generation is simply not sent.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::BotConfig;
use crate::connection::{Connection, Origin};
use crate::markov::LanguageModel;

/// Synthetic partner answering with Markov-generated text
pub struct Bot {
    model: LanguageModel,
    config: BotConfig,
    replies_tx: mpsc::UnboundedSender<Vec<u8>>,
    replies_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Reply currently being read out, and how much of it was consumed
    pending: Vec<u8>,
    pos: usize,
    tasks: Vec<AbortHandle>,
    closed: bool,
}

impl Bot {
    /// Create a bot drawing replies from `model`
    #[must_use]
    pub fn new(model: LanguageModel, config: BotConfig) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            model,
            config,
            replies_tx,
            replies_rx,
            pending: Vec::new(),
            pos: 0,
            tasks: Vec::new(),
            closed: false,
        }
    }

    /// Wrap the bot as a bot-origin [`Connection`]
    #[must_use]
    pub fn into_connection(self) -> Connection {
        Connection::new(self, Origin::Bot)
    }

    /// Number of reply tasks not yet finished
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    fn schedule_reply(&mut self) {
        self.tasks.retain(|t| !t.is_finished());
        if self.tasks.len() >= self.config.max_pending_replies {
            tracing::trace!(
                pending = self.tasks.len(),
                "Reply limit reached, input consumed without a reply"
            );
            return;
        }

        let model = self.model.clone();
        let tx = self.replies_tx.clone();
        let delay = self.config.reply_delay;
        let max_words = self.config.max_words;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let reply = model.generate(max_words);
            if reply.is_empty() {
                tracing::trace!("Model has nothing to say yet");
                return;
            }
            let mut bytes = reply.into_bytes();
            bytes.push(b'\n');
            // Receiver gone means the bot was dropped mid-reply
            let _ = tx.send(bytes);
        });
        self.tasks.push(handle.abort_handle());
    }

    fn abort_replies(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl AsyncRead for Bot {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.pending.len() {
                    this.pending.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if this.closed {
                return Poll::Ready(Ok(()));
            }

            match this.replies_rx.poll_recv(cx) {
                Poll::Ready(Some(reply)) => {
                    this.pending = reply;
                    this.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Bot {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "bot is closed",
            )));
        }
        if !buf.is_empty() {
            this.schedule_reply();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.closed = true;
        this.abort_replies();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Bot {
    fn drop(&mut self) {
        self.abort_replies();
    }
}
