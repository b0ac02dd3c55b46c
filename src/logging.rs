//! Tracing setup.
//!
//! `start` runs with [`init_production`]: JSON lines to a daily-rolling
//! file plus human-readable stderr. One-shot subcommands use [`init_cli`].
//! Both honour `RUST_LOG` and fall back to [`DEFAULT_FILTER`].

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Log file prefix; the appender adds `.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "spendwire.log";

/// Keeps the file writer alive. Dropping it flushes buffered lines.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install file and console logging for the long-running engine.
///
/// # Errors
///
/// Returns an error if `logs_dir` cannot be created or a global subscriber
/// is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Console-only logging for one-shot commands. A no-op if a subscriber is
/// already installed.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
