use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_notify::{StdoutNotifier, TelegramBot, TelegramNotifier};
use jobwatch_storage::HistoryStore;
use jobwatch_sync::{JobwatchConfig, Notifier, Pipeline, RunMode, SourceMode, SourceRegistry};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobwatch-cli")]
#[command(about = "Job posting watcher command-line interface")]
struct Cli {
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true, env = "JOBWATCH_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Fetch, filter and notify once.
    Run {
        /// Print the digest instead of sending it; history is not written.
        #[arg(long)]
        dry_run: bool,
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Answer /hoy and /today on Telegram until interrupted.
    Bot,
    /// Show the most recent history entries.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show the resolved source registry.
    Sources,
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, stderr_layer) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => (None, Some(fmt::layer().compact().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

fn telegram_from(config: &JobwatchConfig) -> Result<(TelegramNotifier, i64)> {
    let token = config
        .telegram_bot_token
        .as_ref()
        .context("TELEGRAM_BOT_TOKEN is not set")?;
    let user_id = config
        .telegram_user_id
        .context("TELEGRAM_USER_ID is not set")?;
    let notifier =
        TelegramNotifier::new(token.expose(), user_id).with_timeout(config.http_timeout_secs);
    Ok((notifier, user_id))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; run until killed");
        std::future::pending::<()>().await;
    }
}

async fn run_once(config: &JobwatchConfig, dry_run: bool, json: bool) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config)?;
    let notifier: Box<dyn Notifier> = if dry_run {
        pipeline = pipeline.dry_run();
        Box::new(StdoutNotifier)
    } else {
        let (telegram, _) =
            telegram_from(config).context("telegram delivery needs credentials (or use --dry-run)")?;
        Box::new(telegram)
    };

    let report = pipeline.run_once(notifier.as_ref()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary_line());
    }
    if let Some(err) = &report.notify_error {
        warn!(error = %err, "digest was not delivered");
    }
    Ok(())
}

async fn run_bot(config: &JobwatchConfig) -> Result<()> {
    let (telegram, user_id) = telegram_from(config).context("bot mode needs telegram credentials")?;
    let pipeline = Arc::new(Pipeline::from_config(config)?);
    info!(sources = ?pipeline.sources(), "starting bot");
    TelegramBot::new(telegram, pipeline, user_id)
        .run(shutdown_signal())
        .await
}

async fn show_history(config: &JobwatchConfig, limit: usize) -> Result<()> {
    let store = HistoryStore::new(config.history_file.clone());
    let entries = store
        .entries()
        .await
        .with_context(|| format!("reading {}", store.path().display()))?;
    println!("{} entries in {}", entries.len(), store.path().display());
    let skip = entries.len().saturating_sub(limit);
    for entry in entries.iter().skip(skip) {
        println!(
            "{}  {:<8}  {} | {} | {}",
            entry.extraction_time.format("%d/%m/%Y %H:%M"),
            entry.source.display_name(),
            entry.title,
            entry.company,
            entry.url
        );
    }
    Ok(())
}

fn show_sources(config: &JobwatchConfig) -> Result<()> {
    let registry = SourceRegistry::load(&config.sources_file)?;
    for entry in &registry.sources {
        let mode = match entry.mode {
            SourceMode::Live => "live",
            SourceMode::Fixture => "fixture",
        };
        let state = if entry.enabled { "enabled" } else { "disabled" };
        println!("{:<9} {mode:<8} {state}", entry.source.as_str());
        for url in &entry.listing_urls {
            println!("    url     {url}");
        }
        for path in &entry.fixture_paths {
            println!("    fixture {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let config = JobwatchConfig::from_env().context("loading configuration")?;
    let command = cli.command.unwrap_or(match config.run_mode {
        RunMode::Cron => Commands::Run {
            dry_run: false,
            json: false,
        },
        RunMode::Bot => Commands::Bot,
    });

    match command {
        Commands::Run { dry_run, json } => run_once(&config, dry_run, json).await,
        Commands::Bot => run_bot(&config).await,
        Commands::History { limit } => show_history(&config, limit).await,
        Commands::Sources => show_sources(&config),
    }
}
