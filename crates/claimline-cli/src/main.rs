//! Claimline CLI
//!
//! Runs the demo journalism pipeline over a file feed and exposes the
//! administrative controls:
//! - Inspect items, the audit log and supervisor health
//! - Freeze and unfreeze the engine
//! - Reset health counters
//! - Override blocked or failed items

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use claimline_engine::{open_store, FileStore, PipelineEngine, PublicationSink, StorageConfig};
use claimline_ledger::{FileJournal, IntegrityLedger};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod demo;
mod settings;

use commands::Commands;
use settings::Settings;

/// Claimline CLI application
#[derive(Parser)]
#[command(name = "claimline")]
#[command(about = "Claimline - staged verification pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLAIMLINE_CONFIG")]
    config: Option<String>,

    /// Data directory for items, control state and the audit journal
    #[arg(long, env = "CLAIMLINE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "CLAIMLINE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(data_dir) = cli.data_dir {
        settings.storage = StorageConfig::File { data_dir };
    }
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    settings.logging.json |= cli.json_logs;

    init_tracing(&settings);

    commands::execute(cli.command, &settings).await
}

fn init_tracing(settings: &Settings) {
    // stdout carries command output, so logs go to stderr
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| settings.logging.level.clone().into());

    if settings.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Open the demo pipeline over the configured storage.
///
/// File storage keeps the audit journal next to the item documents.
pub(crate) async fn open_engine(
    settings: &Settings,
    sink: Option<Arc<dyn PublicationSink>>,
) -> anyhow::Result<PipelineEngine> {
    let mut builder = PipelineEngine::builder(settings.engine.clone())
        .stages(demo::journalism_stages()?)
        .supervisor_config(settings.supervisor.clone());

    builder = match &settings.storage {
        StorageConfig::File { data_dir } => {
            let store = FileStore::open(data_dir)
                .await
                .with_context(|| format!("opening data directory {}", data_dir.display()))?;
            let journal = FileJournal::open(store.audit_journal_path())?;
            let ledger = IntegrityLedger::open(Arc::new(journal))
                .context("replaying the audit journal")?;
            info!(
                data_dir = %data_dir.display(),
                entries = ledger.entry_count(),
                "Opened file storage"
            );
            builder.store(Arc::new(store)).ledger(Arc::new(ledger))
        }
        StorageConfig::Memory => builder.store(open_store(&settings.storage).await?),
    };

    if let Some(sink) = sink {
        builder = builder.sink(sink);
    }
    Ok(builder.build().await?)
}
