//! polo-bot: Poloniex spot triangular-arbitrage trading bot.
//!
//! Usage:
//!   polo-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: config/bot.toml)
//!       --dry-run           Trade against the in-process sim exchange
//!       --log-level <LVL>   Override the configured log level

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use polo_bot::config::BotConfig;
use polo_bot::instant::InstantExecutor;
use polo_bot::intent::manager::IntentManager;
use polo_bot::intent::IntentContext;
use polo_bot::journal::{Journal, MemJournal, PgJournal};
use polo_bot::pathfinder::PathFinder;
use polo_bot::processor::manager::DelayedTradeManager;
use polo_bot::trader::Trader;
use polo_exchange::sim::SimExchange;
use polo_exchange::{BookCache, ExchangeClient};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "polo-bot")]
#[command(about = "Poloniex spot triangular-arbitrage trading bot")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Trade against the in-process sim exchange instead of Poloniex
    #[arg(long)]
    dry_run: bool,

    /// Log level override: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !matches!(&err, dotenvy::Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        BotConfig::default()
    };
    config.apply_env_overrides();
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate().context("configuration validation failed")?;

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    info!("starting polo-bot");
    info!(primaries = ?config.primary_currencies, "primary currencies");
    info!(admin_port = config.http_port, "admin surface port (served by the ops sidecar)");

    let exchange: Arc<dyn ExchangeClient> = if args.dry_run {
        info!("dry-run mode: using the in-process sim exchange");
        Arc::new(SimExchange::new())
    } else {
        // The REST/WebSocket transport ships as a separate SDK build.
        bail!("live Poloniex transport is not wired into this build; run with --dry-run");
    };

    let journal: Arc<dyn Journal> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(url)
                .await
                .context("connecting to the journal database")?;
            let journal = PgJournal::new(pool);
            journal
                .ensure_schema()
                .await
                .context("ensuring journal schema")?;
            info!("journal: postgres");
            Arc::new(journal)
        }
        None => {
            warn!("no DATABASE_URL configured, journaling in memory only");
            Arc::new(MemJournal::new())
        }
    };

    let books = BookCache::new(Arc::clone(&exchange));
    let markets = exchange
        .markets()
        .await
        .context("fetching tradable markets")?;
    info!(markets = markets.len(), "market list loaded");

    let config = Arc::new(config);
    let pathfinder = Arc::new(PathFinder::new(
        books.clone(),
        markets,
        config.max_path_length,
    ));
    let instant = Arc::new(InstantExecutor::new(
        Arc::clone(&exchange),
        books.clone(),
        config.instant.clone(),
    ));
    let processors = Arc::new(DelayedTradeManager::new(
        Arc::clone(&exchange),
        books.clone(),
        Arc::clone(&journal),
    ));
    let intents = Arc::new(IntentManager::new());

    let ctx = Arc::new(IntentContext {
        exchange,
        books,
        journal,
        intents,
        processors,
        pathfinder,
        instant,
        config,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown().await {
            warn!(error = %err, "shutdown signal handler error");
        }
        info!("requesting shutdown");
        let _ = shutdown_tx.send(true);
    });

    Trader::new(ctx).run(shutdown_rx).await
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}
