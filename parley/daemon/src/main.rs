//! Parley Daemon - Anonymous Pairing Chat Server
//!
//! Accepts chat clients over raw TCP, a Unix socket and WebSocket, and hands
//! every connection to the parley matchmaker. Two clients arriving close
//! together chat with each other; a client left alone for too long chats
//! with the Markov bot instead.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP 127.0.0.1:4001, WebSocket 127.0.0.1:4000)
//! parley-daemon
//!
//! # Chat from a terminal
//! nc 127.0.0.1 4001
//!
//! # Custom listeners, WebSocket disabled
//! parley-daemon --tcp-addr 0.0.0.0:4001 --ws-addr "" --socket /tmp/parley.sock
//!
//! # With config file
//! parley-daemon --config /etc/parley/parley.toml
//!
//! # Verbose logging
//! RUST_LOG=debug parley-daemon
//! ```
//!
//! # Configuration Priority
//!
//! CLI flags > `PARLEY_*` environment variables > TOML file > defaults.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (removes the socket file)

mod server;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use parley_core::{config, ConfigOverrides, Matchmaker, ParleyConfig, StartPolicy};

use server::{bind_listeners, DaemonServer, ServerConfig};

/// Parley Daemon - anonymous pairing chat with a Markov bot fallback
#[derive(Parser, Debug)]
#[command(name = "parley-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path (default: ~/.config/parley/parley.toml)
    #[arg(short = 'c', long, env = "PARLEY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Raw TCP listen address ("" disables)
    #[arg(long, value_name = "ADDR")]
    tcp_addr: Option<String>,

    /// WebSocket listen address ("" disables)
    #[arg(long, value_name = "ADDR")]
    ws_addr: Option<String>,

    /// Unix socket path ("" disables)
    #[arg(short = 's', long, value_name = "PATH")]
    socket: Option<String>,

    /// Maximum simultaneously open client connections
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// How long a lone client waits before getting the bot
    #[arg(long, value_name = "MS")]
    pair_timeout_ms: Option<u64>,

    /// Text sent to a client while it waits for a partner
    #[arg(long, value_name = "TEXT")]
    waiting_notice: Option<String>,

    /// Text sent to both sides when a session starts
    #[arg(long, value_name = "TEXT")]
    greeting: Option<String>,

    /// Relay copy buffer size in bytes
    #[arg(long, value_name = "BYTES")]
    buffer_size: Option<usize>,

    /// Bot "thinking" delay before each reply
    #[arg(long, value_name = "MS")]
    bot_delay_ms: Option<u64>,

    /// Maximum words per bot reply
    #[arg(long, value_name = "N")]
    bot_max_words: Option<usize>,

    /// Bot replies allowed in flight at once
    #[arg(long, value_name = "N")]
    bot_max_pending: Option<usize>,

    /// Markov prefix length
    #[arg(long, value_name = "N")]
    order: Option<usize>,

    /// Where bot replies start: most_recent or random
    #[arg(long, value_name = "POLICY")]
    start_policy: Option<StartPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "PARLEY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref addr) = self.tcp_addr {
            overrides = overrides.with_tcp_addr(addr.clone());
        }
        if let Some(ref addr) = self.ws_addr {
            overrides = overrides.with_websocket_addr(addr.clone());
        }
        if let Some(ref path) = self.socket {
            overrides = overrides.with_unix_socket(PathBuf::from(path));
        }
        if let Some(max) = self.max_connections {
            overrides = overrides.with_max_connections(max);
        }
        if let Some(ms) = self.pair_timeout_ms {
            overrides = overrides.with_pair_timeout(Duration::from_millis(ms));
        }
        if let Some(ref notice) = self.waiting_notice {
            overrides = overrides.with_waiting_notice(notice.clone());
        }
        if let Some(ref greeting) = self.greeting {
            overrides = overrides.with_greeting(greeting.clone());
        }
        if let Some(size) = self.buffer_size {
            overrides = overrides.with_buffer_size(size);
        }
        if let Some(ms) = self.bot_delay_ms {
            overrides = overrides.with_reply_delay(Duration::from_millis(ms));
        }
        if let Some(words) = self.bot_max_words {
            overrides = overrides.with_max_words(words);
        }
        if let Some(pending) = self.bot_max_pending {
            overrides = overrides.with_max_pending_replies(pending);
        }
        if let Some(order) = self.order {
            overrides = overrides.with_order(order);
        }
        if let Some(policy) = self.start_policy {
            overrides = overrides.with_start_policy(policy);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            tracing_subscriber::EnvFilter::try_new(format!(
                "parley_daemon={level},parley_core={level}"
            ))
        })
        .with_context(|| format!("Invalid log level: {level}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

/// Load file and environment configuration, then apply CLI flags
fn resolve_config(args: &Args) -> Result<ParleyConfig> {
    let path = args.config.clone().or_else(config::default_config_path);
    let mut config = config::load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Resolve once SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!("Parley daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        pair_timeout_ms = config.matchmaker.pair_timeout.as_millis() as u64,
        bot_delay_ms = config.bot.reply_delay.as_millis() as u64,
        bot_max_words = config.bot.max_words,
        order = config.model.order,
        start_policy = ?config.model.start_policy,
        "Configuration loaded"
    );
    if let Some(ref path) = config.config_file_path {
        info!(path = %path.display(), "Config file");
    }

    let acceptors = bind_listeners(&config.transport).await?;
    let matchmaker = Matchmaker::new(&config);
    let server = DaemonServer::new(matchmaker.clone(), ServerConfig::from(&config.transport))
        .with_socket_path(config.transport.unix_socket.clone());

    let result = server.run(acceptors, shutdown_signal()).await;

    let model = matchmaker.model().stats();
    info!(
        prefixes = model.prefixes,
        transitions = model.transitions,
        "Language model discarded"
    );

    match result {
        Ok(()) => {
            info!("Parley daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
