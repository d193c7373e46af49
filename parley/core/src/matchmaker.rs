//! Matchmaker
//!
//! Pairs each offered connection with another waiting connection, or with a
//! [`Bot`] once the pairing timeout expires. [`Matchmaker::offer`] is the
//! single entry point for the transport layer.
//!
//! # Rendezvous
//!
//! A single slot, guarded by a mutex, holds at most one waiting connection.
//!
//! ```text
//!   offer(c) ──► write waiting notice
//!                    │
//!             lock slot ──── occupied ──► take it, notify waiter,
//!                    │                    relay(waiter, c)     → Human
//!                  empty
//!                    │
//!             park c in slot, then race:
//!               ├─ claimed by a later offer                   → Claimed
//!               └─ timeout: lock slot, still ours? ── yes ──► relay(c, bot) → Bot
//!                                                     no ───► wait for claim → Claimed
//! ```
//!
//! Removing a connection from the slot only ever happens under the lock, so
//! a connection is handed to exactly one relay. When the claim and the
//! timeout are ready at the same time, the claim wins.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::bot::Bot;
use crate::config::{BotConfig, MatchmakerConfig, ParleyConfig};
use crate::connection::{Connection, ConnectionId};
use crate::markov::LanguageModel;
use crate::relay::{Relay, SessionSummary};

/// How an offered connection was placed into a session
#[derive(Debug)]
pub enum MatchOutcome {
    /// A later offer took this connection and drives the session
    Claimed {
        /// The connection that claimed it (None if the claimer vanished
        /// before reporting itself)
        by: Option<ConnectionId>,
    },
    /// This offer found a waiting human and drove the session to its end
    Human(SessionSummary),
    /// No partner arrived in time; this offer drove a session with a bot
    Bot(SessionSummary),
}

impl MatchOutcome {
    /// Summary of the session, if this offer drove it
    #[must_use]
    pub fn summary(&self) -> Option<&SessionSummary> {
        match self {
            Self::Claimed { .. } => None,
            Self::Human(summary) | Self::Bot(summary) => Some(summary),
        }
    }
}

/// Matchmaker counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatchmakerStats {
    /// Total connections offered
    pub offers: u64,
    /// Sessions formed between two humans
    pub human_sessions: u64,
    /// Sessions formed with a bot
    pub bot_sessions: u64,
    /// Connections currently parked in the slot (0 or 1)
    pub waiting: usize,
    /// Sessions currently relaying
    pub active_sessions: usize,
}

struct Waiting {
    ticket: u64,
    conn: Connection,
    claimed: oneshot::Sender<ConnectionId>,
}

enum Rendezvous {
    Partner(Waiting, Connection),
    Parked,
}

struct Inner {
    config: MatchmakerConfig,
    bot_config: BotConfig,
    relay: Relay,
    model: LanguageModel,
    slot: Mutex<Option<Waiting>>,
    next_ticket: AtomicU64,
    offers: AtomicU64,
    human_sessions: AtomicU64,
    bot_sessions: AtomicU64,
    active_sessions: AtomicUsize,
}

/// Pairs connections into sessions
///
/// Cheap to clone; all clones share the same slot and language model.
#[derive(Clone)]
pub struct Matchmaker {
    inner: Arc<Inner>,
}

impl Matchmaker {
    /// Create a matchmaker with a fresh language model
    #[must_use]
    pub fn new(config: &ParleyConfig) -> Self {
        Self::with_model(config, LanguageModel::new(&config.model))
    }

    /// Create a matchmaker around an existing language model
    #[must_use]
    pub fn with_model(config: &ParleyConfig, model: LanguageModel) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.matchmaker.clone(),
                bot_config: config.bot.clone(),
                relay: Relay::new(config.relay.clone(), model.clone()),
                model,
                slot: Mutex::new(None),
                next_ticket: AtomicU64::new(1),
                offers: AtomicU64::new(0),
                human_sessions: AtomicU64::new(0),
                bot_sessions: AtomicU64::new(0),
                active_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// The shared language model
    #[must_use]
    pub fn model(&self) -> &LanguageModel {
        &self.inner.model
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> MatchmakerStats {
        MatchmakerStats {
            offers: self.inner.offers.load(Ordering::Relaxed),
            human_sessions: self.inner.human_sessions.load(Ordering::Relaxed),
            bot_sessions: self.inner.bot_sessions.load(Ordering::Relaxed),
            waiting: usize::from(self.inner.slot.lock().is_some()),
            active_sessions: self.inner.active_sessions.load(Ordering::Relaxed),
        }
    }

    /// Place `conn` into a session
    ///
    /// Resolves once the connection has been handed off: either when the
    /// session this call drove has ended, or when another offer claimed the
    /// connection. Never fails.
    pub async fn offer(&self, conn: Connection) -> MatchOutcome {
        self.inner.offers.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("offer", conn_id = %conn.id(), origin = %conn.origin());
        self.rendezvous(conn).instrument(span).await
    }

    async fn rendezvous(&self, mut conn: Connection) -> MatchOutcome {
        if let Err(e) = conn.send(self.inner.config.waiting_notice.as_bytes()).await {
            tracing::debug!(error = %e, "Waiting notice not delivered");
        }

        let me = conn.id();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (claimed_tx, mut claimed_rx) = oneshot::channel();

        let rendezvous = {
            let mut slot = self.inner.slot.lock();
            match slot.take() {
                Some(waiting) => Rendezvous::Partner(waiting, conn),
                None => {
                    *slot = Some(Waiting {
                        ticket,
                        conn,
                        claimed: claimed_tx,
                    });
                    Rendezvous::Parked
                }
            }
        };

        match rendezvous {
            Rendezvous::Partner(waiting, conn) => {
                let Waiting {
                    conn: partner,
                    claimed,
                    ..
                } = waiting;
                if claimed.send(me).is_err() {
                    tracing::debug!(partner = %partner.id(), "Waiting offer already gone");
                }
                tracing::info!(partner = %partner.id(), "Paired with waiting connection");
                self.inner.human_sessions.fetch_add(1, Ordering::Relaxed);
                MatchOutcome::Human(self.drive(partner, conn).await)
            }
            Rendezvous::Parked => {
                tracing::debug!(
                    timeout_ms = self.inner.config.pair_timeout.as_millis() as u64,
                    "Waiting for a partner"
                );
                let parked = ParkedTicket {
                    slot: &self.inner.slot,
                    ticket,
                };

                tokio::select! {
                    biased;
                    by = &mut claimed_rx => return claimed(by.ok()),
                    () = tokio::time::sleep(self.inner.config.pair_timeout) => {}
                }

                match parked.reclaim() {
                    Some(waiting) => {
                        tracing::info!("No partner arrived, pairing with bot");
                        let bot = Bot::new(self.inner.model.clone(), self.inner.bot_config.clone())
                            .into_connection();
                        self.inner.bot_sessions.fetch_add(1, Ordering::Relaxed);
                        MatchOutcome::Bot(self.drive(waiting.conn, bot).await)
                    }
                    None => claimed(claimed_rx.await.ok()),
                }
            }
        }
    }

    async fn drive(&self, a: Connection, b: Connection) -> SessionSummary {
        self.inner.active_sessions.fetch_add(1, Ordering::Relaxed);
        let summary = self.inner.relay.run(a, b).await;
        self.inner.active_sessions.fetch_sub(1, Ordering::Relaxed);
        summary
    }
}

fn claimed(by: Option<ConnectionId>) -> MatchOutcome {
    match by {
        Some(by) => tracing::debug!(by = %by, "Claimed by arriving connection"),
        None => tracing::warn!("Claimed without a claimer id"),
    }
    MatchOutcome::Claimed { by }
}

/// A parked offer's hold on the slot
///
/// Dropping it (for example when the offering task is cancelled) removes the
/// parked connection if it is still unclaimed, so no later offer pairs with
/// an abandoned connection.
struct ParkedTicket<'a> {
    slot: &'a Mutex<Option<Waiting>>,
    ticket: u64,
}

impl ParkedTicket<'_> {
    fn reclaim(&self) -> Option<Waiting> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|w| w.ticket == self.ticket) {
            slot.take()
        } else {
            None
        }
    }
}

impl Drop for ParkedTicket<'_> {
    fn drop(&mut self) {
        if let Some(waiting) = self.reclaim() {
            tracing::debug!(conn_id = %waiting.conn.id(), "Offer cancelled while waiting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::Instant;

    fn matchmaker() -> Matchmaker {
        let config = ParleyConfig::default();
        Matchmaker::with_model(&config, LanguageModel::with_seed(&ModelConfig::default(), 5))
    }

    fn human() -> (Connection, DuplexStream) {
        Connection::in_process_pair(crate::connection::Origin::human("test"), 4096)
    }

    async fn expect_text(far: &mut DuplexStream, text: &str) {
        let mut buf = vec![0u8; text.len()];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_offer_gets_bot_after_timeout() {
        let mm = matchmaker();
        let (conn, mut far) = human();
        let started = Instant::now();

        let task = tokio::spawn({
            let mm = mm.clone();
            async move { mm.offer(conn).await }
        });

        expect_text(&mut far, "Waiting for a partner...\n").await;
        expect_text(&mut far, "Found one! Say hi.\n").await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));

        drop(far);
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Bot(_)));

        let stats = mm.stats();
        assert_eq!(stats.offers, 1);
        assert_eq!(stats.bot_sessions, 1);
        assert_eq!(stats.human_sessions, 0);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_offers_pair_together() {
        let mm = matchmaker();
        let (first, mut far_first) = human();
        let (second, mut far_second) = human();
        let (first_id, second_id) = (first.id(), second.id());

        let first_task = tokio::spawn({
            let mm = mm.clone();
            async move { mm.offer(first).await }
        });
        expect_text(&mut far_first, "Waiting for a partner...\n").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mm.stats().waiting, 1);

        let second_task = tokio::spawn({
            let mm = mm.clone();
            async move { mm.offer(second).await }
        });
        expect_text(&mut far_second, "Waiting for a partner...\n").await;
        expect_text(&mut far_first, "Found one! Say hi.\n").await;
        expect_text(&mut far_second, "Found one! Say hi.\n").await;

        match first_task.await.unwrap() {
            MatchOutcome::Claimed { by } => assert_eq!(by, Some(second_id)),
            other => panic!("expected claim, got {other:?}"),
        }

        drop(far_second);
        match second_task.await.unwrap() {
            MatchOutcome::Human(summary) => {
                assert_eq!(summary.a, first_id);
                assert_eq!(summary.b, second_id);
            }
            other => panic!("expected human session, got {other:?}"),
        }
        drop(far_first);

        let stats = mm.stats();
        assert_eq!(stats.human_sessions, 1);
        assert_eq!(stats.bot_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_in_flight_at_deadline_beats_bot() {
        let mm = matchmaker();
        let (conn, mut far) = human();

        let task = tokio::spawn({
            let mm = mm.clone();
            async move { mm.offer(conn).await }
        });
        expect_text(&mut far, "Waiting for a partner...\n").await;
        tokio::time::sleep(Duration::from_millis(4900)).await;

        // Take the parked offer the way an arriving partner does, but hold
        // back the claim until the deadline has passed
        let waiting = mm.inner.slot.lock().take().expect("offer should be parked");
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(!task.is_finished(), "offer must keep waiting for its claimer");

        let claimer = ConnectionId::new();
        waiting.claimed.send(claimer).unwrap();

        match task.await.unwrap() {
            MatchOutcome::Claimed { by } => assert_eq!(by, Some(claimer)),
            other => panic!("expected claim, got {other:?}"),
        }
        let stats = mm.stats();
        assert_eq!(stats.bot_sessions, 0);
        assert_eq!(stats.waiting, 0);
        waiting.conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_offer_leaves_slot() {
        let mm = matchmaker();
        let (conn, mut far) = human();

        let task = tokio::spawn({
            let mm = mm.clone();
            async move { mm.offer(conn).await }
        });
        expect_text(&mut far, "Waiting for a partner...\n").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mm.stats().waiting, 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(mm.stats().waiting, 0);

        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_failure_does_not_block_pairing() {
        let mm = matchmaker();
        let (conn, far) = human();
        drop(far);

        let outcome = mm.offer(conn).await;

        // Greeting fails on the dead connection, but the offer still resolves.
        let summary = outcome.summary().expect("bot session driven");
        assert!(summary.error.is_some());
    }
}
