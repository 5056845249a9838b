//! cross-send - Background daemon for publishing and token refresh
//!
//! Hosts the publish worker pool, polls for scheduled posts that are due,
//! and runs the periodic token refresh scan.

use anyhow::Context;
use clap::Parser;
use libcrosscast::logging::LoggingConfig;
use libcrosscast::platforms::{mock::MockConnector, ConnectorRegistry};
use libcrosscast::{Config, CrosscastError, CrosscastService, Platform};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cross-send")]
#[command(version)]
#[command(about = "Background daemon for publishing posts and refreshing tokens")]
#[command(long_about = "\
cross-send - Background daemon for publishing posts and refreshing tokens

DESCRIPTION:
    cross-send is a long-running daemon that drains the Crosscast job queue.
    It runs one publish worker per platform, polls the database for scheduled
    posts that are due, and periodically refreshes credentials of connected
    accounts that are about to expire.

USAGE:
    # Run in foreground (logs to stderr)
    cross-send

    # Run with custom poll interval
    cross-send --poll-interval 30

    # Dispatch due posts once, wait for the workers, and exit
    cross-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes queued and in-flight jobs)

CONFIGURATION:
    Configuration file: ~/.config/crosscast/config.toml (or CROSSCAST_CONFIG)
    Database location:  ~/.local/share/crosscast/crosscast.db

    [queue]
    poll_interval = \"60s\"
    max_attempts = 3
    backoff_base = \"1s\"
    job_timeout = \"5m\"
    synchronous_platforms = [\"x\"]

    [refresh]
    period = \"24h\"
    lookahead = \"7d\"

LOGGING:
    CROSSCAST_LOG_FORMAT  text | json | pretty (default: text)
    CROSSCAST_LOG_LEVEL   error | warn | info | debug | trace (default: info)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check for due posts (default: from config, 60)")]
    poll_interval: Option<u64>,

    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process due posts once and exit
    #[arg(long)]
    once: bool,

    /// Publish through simulated connectors instead of real platforms
    #[arg(long, hide = true)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cross-send stopped with an error");
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<CrosscastError>()
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(secs) = cli.poll_interval {
        config.queue.poll_interval = Duration::from_secs(secs.max(1));
    }
    let poll_interval = config.queue.poll_interval;

    let registry = if cli.simulate {
        simulated_registry()?
    } else {
        ConnectorRegistry::new()
    };
    if registry.platforms().is_empty() {
        warn!("No platform connectors registered; due targets will fail");
    }

    info!("cross-send daemon starting");
    let mut service = CrosscastService::from_config(config, registry).await?;

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let pool = service.start_workers()?;
    info!(
        poll_interval_secs = poll_interval.as_secs(),
        workers = ?pool.queue().queued_platforms(),
        "Workers started"
    );

    if cli.once {
        process_due_posts(&service).await;
        info!("cross-send: processed due posts once, exiting");
    } else {
        run_daemon_loop(&service, poll_interval, shutdown).await;
    }

    pool.shutdown().await;
    info!("cross-send daemon stopped");
    Ok(())
}

/// Load the configuration; a missing default file means built-in defaults
fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        return Ok(Config::load_from_path(path)?);
    }

    let path = libcrosscast::config::resolve_config_path()?;
    if path.exists() {
        Ok(Config::load_from_path(&path)?)
    } else {
        info!(path = %path.display(), "No configuration file, using defaults");
        Ok(Config::default())
    }
}

fn simulated_registry() -> anyhow::Result<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new();
    for platform in Platform::ALL {
        registry
            .register(Arc::new(MockConnector::success(platform)))
            .with_context(|| format!("registering simulated {} connector", platform))?;
    }
    Ok(registry)
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

async fn run_daemon_loop(service: &CrosscastService, poll_interval: Duration, shutdown: Arc<AtomicBool>) {
    let tick = Duration::from_secs(1);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        process_due_posts(service).await;

        // Sleep until the next poll, checking for shutdown every second
        let mut waited = Duration::ZERO;
        while waited < poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(tick).await;
            waited += tick;
        }
    }
}

async fn process_due_posts(service: &CrosscastService) {
    let now = chrono::Utc::now().timestamp();
    match service.posts().dispatch_due_posts(now).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Dispatched due posts"),
        Err(e) => error!(error = %e, "Error processing due posts"),
    }
}
