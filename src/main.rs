//! Janus videocall CLI - signaling client for the Janus videocall plugin
//!
//! Registers a username with a Janus gateway, places and answers calls,
//! and negotiates the WebRTC session (SDP offer/answer plus trickle ICE).

mod calling;
mod client;
mod config;
mod error;
mod event;
mod janus;
mod transport;

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::calling::ProbeEngine;
use crate::client::{Client, ClientHandle};
use crate::config::Config;
use crate::error::SignalError;
use crate::event::ClientEvent;
use crate::transport::{JanusSocket, SUBPROTOCOL};

#[derive(Parser)]
#[command(name = "janus-videocall")]
#[command(about = "Signaling client for the Janus videocall plugin", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway WebSocket URL (overrides the config file)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Username to register (overrides the config file)
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and wait for incoming calls (reconnects on failure)
    Listen {
        /// Answer incoming calls automatically
        #[arg(long)]
        auto_accept: bool,
    },

    /// Register and call a peer
    Call {
        /// Username to call
        peer: String,

        /// Hang up after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// List users registered with the videocall plugin
    Peers,

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file if it does not exist
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    let mut config = Config::load_from(&config_path)?;
    if let Some(server) = cli.server {
        config.server_uri = server;
    }
    if let Some(username) = cli.username {
        config.username = Some(username);
    }

    match cli.command {
        Commands::Listen { auto_accept } => {
            config.validate()?;
            listen(&config, auto_accept || config.auto_accept).await?;
        }
        Commands::Call { peer, duration } => {
            config.validate()?;
            call(&config, &peer, duration.map(Duration::from_secs)).await?;
        }
        Commands::Peers => {
            config.validate()?;
            peers(&config).await?;
        }
        Commands::Config { init } => {
            if init && !config_path.exists() {
                Config::default().save_to(&config_path)?;
                println!("Wrote defaults to {}", config_path.display());
            }
            println!("# {}", config_path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
            if let Err(e) = config.validate() {
                println!("# invalid: {:#}", e);
            }
        }
    }

    Ok(())
}

/// A running client plus the channels to talk to it.
struct Connection {
    handle: ClientHandle,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<Result<(), SignalError>>,
}

impl Connection {
    /// Connect, create the session and wait until the plugin handle is attached.
    async fn open(config: &Config) -> Result<Self> {
        let socket = JanusSocket::connect(
            &config.server_uri,
            SUBPROTOCOL,
            config.connect_timeout(),
            config.idle_interval(),
        )
        .await?;
        let engine = ProbeEngine::new(config.enable_h264_high_profile);
        let (client, handle, events) = Client::new(socket, engine, config.client_config());
        let mut conn = Self {
            handle,
            events,
            task: tokio::spawn(client.run()),
        };

        loop {
            match conn.events.recv().await {
                Some(ClientEvent::Connected {
                    session_id,
                    handle_id,
                }) => {
                    tracing::info!("Session {} ready (handle {})", session_id, handle_id);
                    return Ok(conn);
                }
                Some(ClientEvent::Disconnected { error }) => {
                    let _ = conn.task.await;
                    return Err(match error {
                        Some(e) => anyhow::Error::from(e).context("Session setup failed"),
                        None => anyhow::anyhow!("Session closed during setup"),
                    });
                }
                Some(other) => tracing::debug!("{}", other),
                None => anyhow::bail!("Client stopped during setup"),
            }
        }
    }

    /// Orderly teardown: hangup, detach, destroy, close.
    async fn close(self) -> Result<()> {
        self.handle.shutdown();
        self.task
            .await
            .context("Client task failed")?
            .context("Session ended with an error")
    }
}

fn require_username(config: &Config) -> Result<String> {
    config
        .username
        .clone()
        .context("No username. Pass --username or set `username` in the config file.")
}

/// Resolves after `limit`, or never.
fn deadline(limit: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match limit {
            Some(d) => time::sleep(d).await,
            None => std::future::pending().await,
        }
    }
}

/// Reason one `listen` session ended.
enum DisconnectReason {
    /// Ctrl+C. Do not reconnect.
    Shutdown,
    /// Transport or session failure. Should reconnect.
    Error(anyhow::Error),
}

/// Listen for calls, reconnecting with exponential backoff (1s, 2s, 4s, ...
/// capped at 64s). A session that stayed up for a minute resets the backoff.
async fn listen(config: &Config, auto_accept: bool) -> Result<()> {
    let username = require_username(config)?;
    let stability_threshold = Duration::from_secs(60);
    let mut backoff = 1u64;

    loop {
        let started = Instant::now();
        let error = match listen_once(config, &username, auto_accept).await {
            Ok(DisconnectReason::Shutdown) => return Ok(()),
            Ok(DisconnectReason::Error(e)) => e,
            Err(e) => {
                // Registration refused is not going to improve by retrying.
                if let Some(SignalError::NotRegistered(_)) = e.downcast_ref::<SignalError>() {
                    return Err(e);
                }
                e
            }
        };
        if started.elapsed() >= stability_threshold {
            backoff = 1;
        }
        tracing::warn!("Disconnected: {:#}. Reconnecting in {}s...", error, backoff);

        tokio::select! {
            _ = time::sleep(Duration::from_secs(backoff)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                return Ok(());
            }
        }
        backoff = (backoff * 2).min(64);
    }
}

/// One connection: register, then handle events until the session ends.
async fn listen_once(config: &Config, username: &str, auto_accept: bool) -> Result<DisconnectReason> {
    let mut conn = Connection::open(config).await?;
    if let Err(e) = conn.handle.register(username).await {
        let _ = conn.close().await;
        return Err(e).context("Registration failed");
    }
    println!("Registered as {}. Waiting for calls... (Ctrl-C to stop)", username);

    loop {
        tokio::select! {
            event = conn.events.recv() => match event {
                Some(ClientEvent::IncomingCall { peer }) => {
                    let handle = conn.handle.clone();
                    if auto_accept {
                        println!("Incoming call from {}, answering", peer);
                        tokio::spawn(async move {
                            if let Err(e) = handle.accept_incoming().await {
                                tracing::warn!("Could not answer {}: {}", peer, e);
                            }
                        });
                    } else {
                        println!("Incoming call from {}, rejecting (use --auto-accept to answer)", peer);
                        tokio::spawn(async move {
                            if let Err(e) = handle.reject_incoming().await {
                                tracing::warn!("Could not reject {}: {}", peer, e);
                            }
                        });
                    }
                }
                Some(ClientEvent::Disconnected { error }) => {
                    println!("Disconnected");
                    let _ = conn.task.await;
                    return Ok(match error {
                        Some(e) => DisconnectReason::Error(e.into()),
                        None => DisconnectReason::Shutdown,
                    });
                }
                Some(event) => println!("{}", event),
                None => {
                    return Ok(DisconnectReason::Error(anyhow::anyhow!("Client stopped")));
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                conn.close().await?;
                return Ok(DisconnectReason::Shutdown);
            }
        }
    }
}

async fn call(config: &Config, peer: &str, duration: Option<Duration>) -> Result<()> {
    let username = require_username(config)?;
    let mut conn = Connection::open(config).await?;

    let placed = async {
        conn.handle
            .register(&username)
            .await
            .context("Registration failed")?;
        conn.handle
            .place_call(peer)
            .await
            .with_context(|| format!("Call to {} failed", peer))
    }
    .await;
    if let Err(e) = placed {
        while let Ok(event) = conn.events.try_recv() {
            println!("{}", event);
        }
        let _ = conn.close().await;
        return Err(e);
    }
    println!("Calling {}... (Ctrl-C to hang up)", peer);

    let hangup_timer = deadline(duration);
    tokio::pin!(hangup_timer);
    let mut hung_up = false;

    loop {
        tokio::select! {
            event = conn.events.recv() => match event {
                Some(event @ ClientEvent::CallEnded { .. }) => {
                    println!("{}", event);
                    break;
                }
                Some(ClientEvent::Disconnected { error }) => {
                    let _ = conn.task.await;
                    return match error {
                        Some(e) => Err(e).context("Session lost during the call"),
                        None => Ok(()),
                    };
                }
                Some(event) => println!("{}", event),
                None => anyhow::bail!("Client stopped"),
            },
            _ = &mut hangup_timer, if !hung_up => {
                println!("Hanging up");
                hung_up = true;
                conn.handle.hangup();
            }
            _ = tokio::signal::ctrl_c(), if !hung_up => {
                println!("Hanging up");
                hung_up = true;
                conn.handle.hangup();
            }
        }
    }

    conn.close().await
}

async fn peers(config: &Config) -> Result<()> {
    let conn = Connection::open(config).await?;
    let listed = conn.handle.list_peers().await;
    conn.close().await?;

    let peers = listed.context("Failed to list peers")?;
    if peers.is_empty() {
        println!("No registered peers");
    }
    for peer in peers {
        println!("{}", peer);
    }
    Ok(())
}
