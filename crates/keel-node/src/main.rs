//! # Keel Node
//!
//! Demo binary for the keel transport. Runs either an echo server that
//! returns every message to its sender, or a client that sends a batch of
//! reliable messages and waits for their echoes.
//!
//! ## Usage
//!
//! ```bash
//! # Echo server
//! keel-node server --bind 0.0.0.0:7777
//!
//! # Client sending ten messages
//! keel-node client --server 127.0.0.1:7777 --message hello --count 10
//!
//! # Custom timers
//! keel-node --config node.toml server --bind 0.0.0.0:7777
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keel_transport::{Client, EndpointConfig, Error, Event, SendMode, Server};

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Keel reliable UDP demo node.
#[derive(Parser, Debug)]
#[command(name = "keel-node", about = "Keel reliable UDP echo server and client")]
struct Cli {
    /// Endpoint configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept clients and echo every message back.
    Server {
        /// Listen address.
        #[arg(long, default_value = "0.0.0.0:7777")]
        bind: SocketAddr,
    },
    /// Connect to a server and send messages.
    Client {
        /// Server address.
        #[arg(long)]
        server: SocketAddr,

        /// Message text.
        #[arg(long, default_value = "hello")]
        message: String,

        /// Number of messages to send.
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing Ctrl-C handler")?;
    }

    match cli.command {
        Command::Server { bind } => run_server(bind, config, &running),
        Command::Client {
            server,
            message,
            count,
        } => run_client(server, &message, count, config, &running),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EndpointConfig> {
    let Some(path) = path else {
        return Ok(EndpointConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    EndpointConfig::from_toml_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))
}

// ─── Server ─────────────────────────────────────────────────────────────────

fn run_server(bind: SocketAddr, config: EndpointConfig, running: &AtomicBool) -> anyhow::Result<()> {
    let mut server = Server::listen(bind, config).context("binding server socket")?;
    let local = server.endpoint().local_addr()?;
    tracing::info!(addr = %local, "keel-node server listening");

    let mut echoed: u64 = 0;
    let mut last_stats_log = Instant::now();

    while running.load(Ordering::Relaxed) {
        if let Err(e) = server.poll() {
            tracing::warn!(error = %e, "poll failed");
        }

        let events: Vec<Event> = server.events().try_iter().collect();
        for event in events {
            match event {
                Event::Connected(peer) => tracing::info!(%peer, "client connected"),
                Event::Disconnected(peer) => tracing::info!(%peer, "client disconnected"),
                Event::ConnectionTimeout(peer) => tracing::warn!(%peer, "client timed out"),
                Event::Received {
                    peer,
                    mode,
                    payload,
                } => match server.send(peer, &payload, mode) {
                    Ok(()) => echoed += 1,
                    Err(e) => tracing::warn!(%peer, error = %e, "echo failed"),
                },
            }
        }

        if last_stats_log.elapsed() >= STATS_INTERVAL {
            let stats = server.stats();
            tracing::info!(
                peers = server.connected_peers().len(),
                echoed,
                sent = stats.datagrams_sent,
                received = stats.datagrams_received,
                retransmitted = stats.retransmitted_slices,
                "server stats"
            );
            last_stats_log = Instant::now();
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    println!("{}", serde_json::to_string_pretty(&server.stats())?);
    tracing::info!(echoed, "keel-node server stopped");
    Ok(())
}

// ─── Client ─────────────────────────────────────────────────────────────────

fn run_client(
    server: SocketAddr,
    message: &str,
    count: usize,
    config: EndpointConfig,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut client = Client::bind_for(server, config).context("binding client socket")?;
    client.connect(server)?;
    tracing::info!(%server, count, "keel-node client connecting");

    let started = Instant::now();
    let mut echoes = 0usize;

    'run: while running.load(Ordering::Relaxed) {
        match client.poll() {
            Ok(()) => {}
            Err(Error::ServerAtCapacity(addr)) => bail!("server {addr} is at capacity"),
            Err(e) => tracing::warn!(error = %e, "poll failed"),
        }

        let events: Vec<Event> = client.events().try_iter().collect();
        for event in events {
            match event {
                Event::Connected(peer) => {
                    tracing::info!(%peer, "connected");
                    for i in 0..count {
                        client.send(format!("{message} #{i}").as_bytes(), SendMode::Reliable)?;
                    }
                    if count == 0 {
                        client.disconnect()?;
                        break 'run;
                    }
                }
                Event::Received { payload, .. } => {
                    echoes += 1;
                    println!("{}", String::from_utf8_lossy(&payload));
                    if echoes == count {
                        tracing::info!(
                            echoes,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            rtt = ?client.rtt(),
                            "all echoes received"
                        );
                        client.disconnect()?;
                        break 'run;
                    }
                }
                Event::ConnectionTimeout(peer) => bail!("no response from {peer}"),
                Event::Disconnected(peer) => {
                    tracing::info!(%peer, "disconnected by server");
                    break 'run;
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    println!("{}", serde_json::to_string_pretty(&client.stats())?);
    tracing::info!(echoes, "keel-node client stopped");
    Ok(())
}
