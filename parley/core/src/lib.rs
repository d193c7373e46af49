//! Parley Core - Anonymous Pairing Chat
//!
//! This crate pairs anonymous duplex connections into private two-party chat
//! sessions. It is transport agnostic: anything that can read, write and
//! close bytes can be offered. If nobody shows up in time, the connection is
//! paired with a bot that talks back using an order-N Markov chain trained on
//! everything people have said through the service.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Transport (daemon: TCP / Unix / WS)               │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │ Connection
//! ┌────────────────────────────────┼─────────────────────────────────┐
//! │                          PARLEY CORE                              │
//! │                    ┌───────────┴───────────┐                      │
//! │                    │      Matchmaker       │── timeout ──► Bot    │
//! │                    └───────────┬───────────┘               │      │
//! │                                │ (a, b)                    │      │
//! │                    ┌───────────┴───────────┐               │      │
//! │                    │         Relay         │◄──────────────┘      │
//! │                    └───────────┬───────────┘                      │
//! │                     human text │ TeeReader        generate        │
//! │                    ┌───────────┴───────────┐◄──────── Bot         │
//! │                    │     LanguageModel     │                      │
//! │                    └───────────────────────┘                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Matchmaker`]: The single entry point; `offer` each accepted connection
//! - [`Connection`]: Duplex byte stream with exactly-once close
//! - [`Relay`]: Runs one session between two connections
//! - [`Bot`]: Synthetic partner answering from the language model
//! - [`LanguageModel`]: Shared, synchronized Markov chain
//! - [`ParleyConfig`]: Tunables loaded from TOML, environment and CLI
//!
//! # Quick Start
//!
//! ```ignore
//! use parley_core::{Connection, Matchmaker, Origin, ParleyConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ParleyConfig::default();
//!     let matchmaker = Matchmaker::new(&config);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:4001").await.unwrap();
//!     loop {
//!         let (stream, _) = listener.accept().await.unwrap();
//!         let conn = Connection::new(stream, Origin::human("tcp"));
//!         let matchmaker = matchmaker.clone();
//!         tokio::spawn(async move { matchmaker.offer(conn).await });
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::new_without_default)]

pub mod bot;
pub mod config;
pub mod connection;
pub mod markov;
pub mod matchmaker;
pub mod relay;
pub mod tee;

// Re-exports for convenience
pub use bot::Bot;
pub use config::{
    load_config, load_config_from_path, BotConfig, ConfigError, ConfigOverrides, ConfigSource,
    MatchmakerConfig, ModelConfig, ParleyConfig, RelayConfig, TransportConfig,
};
pub use connection::{ChatStream, Connection, ConnectionId, Origin};
pub use markov::{Ingestor, LanguageModel, MarkovChain, ModelStats, Prefix, StartPolicy};
pub use matchmaker::{MatchOutcome, Matchmaker, MatchmakerStats};
pub use relay::{Direction, Relay, SessionError, SessionId, SessionSummary};
pub use tee::{TeeReader, TextSink};
