//! Tunnel Keeper Daemon Entry Point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunkeepd::config::DEFAULT_CONFIG_PATH;
use tunkeepd::{FileConfigSource, HttpUpdater, IpRoute2, KeeperSettings, TunnelKeeper};

/// Verbosity used when neither -v nor -q is given (info).
const DEFAULT_VERBOSITY: i16 = 2;

#[derive(Parser, Debug)]
#[command(name = "tunkeepd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run one reconciliation cycle and exit
    #[arg(long)]
    once: bool,

    /// Log mutating commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Base polling frequency in seconds
    #[arg(long)]
    frequency: Option<u64>,

    /// Probe timeout in seconds
    #[arg(long)]
    max_latency: Option<u64>,

    /// Upper bound for repair backoff in seconds
    #[arg(long)]
    max_backoff: Option<u64>,

    /// More output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

fn level_for(verbosity: i16) -> &'static str {
    match verbosity {
        i16::MIN..=0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// RUST_LOG wins over -v/-q when set.
fn init_logging(args: &Args) {
    let verbosity = DEFAULT_VERBOSITY + i16::from(args.verbose) - i16::from(args.quiet);
    let level = level_for(verbosity);
    let base = level_for(verbosity.min(1));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},tunkeepd={},tunkeep_common={}", base, level, level))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Timing from the file's `[timing]` section, overridden by the CLI.
fn load_settings(args: &Args, source: &FileConfigSource) -> Result<KeeperSettings> {
    let timing = source
        .timing()
        .with_context(|| format!("Failed to read {}", source.path().display()))?;

    let mut settings = KeeperSettings::from_timing(&timing, !args.once);
    if let Some(secs) = args.frequency {
        settings.frequency_secs = secs;
    }
    if let Some(secs) = args.max_latency {
        settings.max_latency_secs = secs;
    }
    if let Some(secs) = args.max_backoff {
        settings.max_backoff_secs = secs;
    }
    settings.validate().context("Invalid timing settings")?;
    Ok(settings)
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        token.cancel();
    });
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!(config = %args.config.display(), "Starting tunkeepd");

    let source = FileConfigSource::new(&args.config);
    let settings = load_settings(&args, &source)?;

    if args.dry_run {
        warn!("Dry run: mutating commands and control-plane updates are only logged");
    }
    let net = Arc::new(IpRoute2::new().dry_run(args.dry_run));
    let updater = Arc::new(
        HttpUpdater::new(settings.update_timeout())
            .context("Failed to build control-plane client")?
            .dry_run(args.dry_run),
    );

    let keeper = TunnelKeeper::new(net, updater, Box::new(source), settings)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    tokio::spawn(keeper.run(token))
        .await
        .context("Keeper task panicked")?
        .context("Tunnel keeper stopped")?;

    info!("tunkeepd exiting");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
