//! Spendwire CLI entry point.
//!
//! `start` runs the engine until interrupted; `pair`, `status`, and
//! `logout` are one-shot session management commands.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use spendwire::config::Config;
use spendwire::connection::Acquired;
use spendwire::engine::Engine;
use spendwire::events::{handler_fn, EventKind, SubscribeOptions};
use spendwire::store::settings::SettingsStore;
use spendwire::types::SessionKey;

/// Spendwire: expense capture over chat.
#[derive(Parser)]
#[command(name = "spendwire", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the engine and restore authenticated sessions.
    Start,
    /// Link an identity: print its pairing code and wait for the scan.
    Pair {
        /// Tenant (account) id.
        tenant: String,
        /// Platform identity, e.g. a phone number.
        identity: String,
    },
    /// Print persisted sessions and whether each is authenticated.
    Status,
    /// Log an identity out and delete its credentials.
    Logout {
        /// Tenant (account) id.
        tenant: String,
        /// Platform identity.
        identity: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(&config).await,
        Command::Pair { tenant, identity } => {
            spendwire::logging::init_cli();
            handle_pair(&config, SessionKey::new(tenant, identity)).await
        }
        Command::Status => {
            spendwire::logging::init_cli();
            handle_status(&config).await
        }
        Command::Logout { tenant, identity } => {
            spendwire::logging::init_cli();
            handle_logout(&config, SessionKey::new(tenant, identity)).await
        }
    }
}

/// Run until Ctrl-C, then shut down gracefully.
async fn handle_start(config: &Config) -> anyhow::Result<()> {
    let _logging_guard = spendwire::logging::init_production(&config.paths.logs_dir()?)?;
    info!(version = env!("CARGO_PKG_VERSION"), "spendwire starting");

    let engine = Engine::from_config(config).await?;
    engine.start().await?;

    for (service, status) in engine.health().await {
        info!(service, status = status.label(), details = status.details(), "health");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, initiating graceful shutdown");

    engine.stop().await;
    Ok(())
}

/// Acquire a session and, if the platform asks for pairing, wait for the
/// user to complete it.
async fn handle_pair(config: &Config, key: SessionKey) -> anyhow::Result<()> {
    let engine = Engine::from_config(config).await?;

    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<()>();
    let wanted = key.clone();
    engine.bus().on(
        EventKind::SessionReady,
        handler_fn(move |event| {
            let session: SessionKey = serde_json::from_value(event.payload["session"].clone())?;
            if session == wanted {
                let _ = ready_tx.send(());
            }
            Ok(Value::Null)
        }),
        SubscribeOptions::default(),
    );

    let result = match engine.connections().acquire(&key).await {
        Ok(Acquired::Ready(_)) => {
            println!("{key} is already paired");
            Ok(())
        }
        Ok(Acquired::PairingRequired(pairing)) => {
            println!("Pairing code for {key}: {}", pairing.code);
            println!("Expires at {}", pairing.expires_at.to_rfc3339());
            let ttl = config.connection.to_connection_config().pairing_ttl;
            match tokio::time::timeout(ttl, ready_rx.recv()).await {
                Ok(Some(())) => {
                    println!("{key} paired");
                    Ok(())
                }
                _ => Err(anyhow::anyhow!("pairing for {key} was not completed")),
            }
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("failed to connect {key}"))),
    };

    engine.stop().await;
    result
}

/// Print every persisted session.
async fn handle_status(config: &Config) -> anyhow::Result<()> {
    let path = config.paths.settings_db()?;
    if !path.exists() {
        println!("No sessions (database {} not found)", path.display());
        return Ok(());
    }
    let store = SettingsStore::open(&path).await?;
    let sessions = store.sessions().await?;
    if sessions.is_empty() {
        println!("No sessions");
    }
    for (key, authenticated) in sessions {
        let label = if authenticated {
            "authenticated"
        } else {
            "not authenticated"
        };
        println!("{key}\t{label}");
    }
    Ok(())
}

/// Log out and purge credentials.
async fn handle_logout(config: &Config, key: SessionKey) -> anyhow::Result<()> {
    let engine = Engine::from_config(config).await?;
    let result = engine.connections().logout(&key).await;
    engine.stop().await;
    match result {
        Ok(true) => println!("{key} logged out"),
        Ok(false) => {
            warn!(session = %key, "no live session, removed local credentials only");
            println!("{key} logged out (local credentials removed)");
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("failed to log out {key}"))),
    }
    Ok(())
}
