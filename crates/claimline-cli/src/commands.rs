//! Subcommands. Every command prints pretty JSON on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use claimline_engine::{
    JsonFileFeed, JsonlSink, PipelineEngine, PipelineError, PublicationSink, SourceFeed,
};
use claimline_types::{Item, ItemId, ItemStatus};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::open_engine;
use crate::settings::Settings;

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run every payload from a feed file through the demo pipeline
    Run {
        /// JSON array or JSON-lines file of story payloads
        #[arg(short, long)]
        input: PathBuf,

        /// Publication file (defaults to published.jsonl in the data directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show items
    Status {
        /// Only this item
        #[arg(long)]
        item: Option<String>,
    },

    /// Show the integrity ledger's audit log
    Audit {
        /// Only entries for this item
        #[arg(long)]
        item: Option<String>,

        /// Verify the hash chain
        #[arg(long)]
        verify: bool,
    },

    /// Show supervisor health
    Health {
        /// Run a health check, freezing the engine on any violation
        #[arg(long)]
        check: bool,
    },

    /// Halt all item processing
    Freeze {
        #[arg(long)]
        reason: String,
    },

    /// Resume processing after a freeze
    Unfreeze {
        #[arg(long)]
        justification: String,
    },

    /// Clear supervisor health counters
    ResetCounters,

    /// Re-enter a blocked or failed item at its current stage
    Override {
        #[arg(long)]
        item: String,

        #[arg(long)]
        justification: String,
    },
}

/// Where one item ended up after `run`.
#[derive(Debug, Serialize)]
struct RunOutcome {
    item_id: ItemId,
    status: ItemStatus,
    stage_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute a command
pub async fn execute(command: Commands, settings: &Settings) -> anyhow::Result<()> {
    match command {
        Commands::Run { input, output } => {
            let output = output.unwrap_or_else(|| settings.publication_path());
            run(settings, input, output).await
        }

        Commands::Status { item } => {
            let engine = open_engine(settings, None).await?;
            match item {
                Some(id) => print_json(&engine.status(parse_id(&id)?)?),
                None => print_json(&engine.items()),
            }
        }

        Commands::Audit { item, verify } => {
            let engine = open_engine(settings, None).await?;
            let ledger = engine.ledger();
            let entries = match item {
                Some(id) => ledger.audit_log_for(parse_id(&id)?),
                None => ledger.audit_log().into_entries(),
            };
            if verify {
                print_json(&json!({
                    "entries": entries,
                    "verification": ledger.verify_audit_chain(),
                }))
            } else {
                print_json(&entries)
            }
        }

        Commands::Health { check } => {
            let engine = open_engine(settings, None).await?;
            let snapshot = if check {
                engine.supervisor().check_health().await
            } else {
                engine.supervisor().evaluate()
            };
            print_json(&snapshot)
        }

        Commands::Freeze { reason } => {
            let engine = open_engine(settings, None).await?;
            let supervisor = engine.supervisor();
            let changed = supervisor.freeze(&reason).await?;
            print_json(&json!({
                "changed": changed,
                "control": supervisor.control_snapshot(),
            }))
        }

        Commands::Unfreeze { justification } => {
            let engine = open_engine(settings, None).await?;
            let supervisor = engine.supervisor();
            supervisor.unfreeze(&justification).await?;
            print_json(&supervisor.control_snapshot())
        }

        Commands::ResetCounters => {
            let engine = open_engine(settings, None).await?;
            engine.supervisor().reset_counters().await?;
            print_json(&engine.supervisor().control_snapshot())
        }

        Commands::Override {
            item,
            justification,
        } => {
            let engine = open_engine(settings, None).await?;
            let item = engine
                .override_item(parse_id(&item)?, &justification)
                .await?;
            print_json(&item)
        }
    }
}

async fn run(settings: &Settings, input: PathBuf, output: PathBuf) -> anyhow::Result<()> {
    let sink: Arc<dyn PublicationSink> = Arc::new(JsonlSink::new(&output));
    let engine = Arc::new(open_engine(settings, Some(sink)).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = engine.supervisor().clone().spawn(shutdown_rx);

    let feed = JsonFileFeed::new(&input);
    let payloads = feed
        .fetch()
        .await
        .with_context(|| format!("reading feed {}", input.display()))?;
    info!(payloads = payloads.len(), feed = %input.display(), "Feed loaded");

    let mut outcomes = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let id = match engine.submit(payload).await {
            Ok(id) => id,
            Err(e @ PipelineError::EngineFrozen { .. }) => {
                warn!(error = %e, "Engine frozen, remaining payloads not submitted");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let error = drive(&engine, id).await.err().map(|e| e.to_string());
        let item = engine.status(id)?;
        outcomes.push(outcome(&item, error));
    }

    let health = engine.supervisor().check_health().await;
    let _ = shutdown_tx.send(true);
    supervisor.await.context("supervisor task panicked")?;

    print_json(&json!({
        "items": outcomes,
        "publications": output,
        "health": health,
    }))
}

/// Advance an item until it is terminal, deferred, or hits a non-retryable
/// error. Transformation failures are retried up to the stage's limit.
async fn drive(engine: &PipelineEngine, id: ItemId) -> Result<ItemStatus, PipelineError> {
    loop {
        match engine.advance(id).await {
            Ok(status) if status.is_terminal() => return Ok(status),
            Ok(_) => continue,
            Err(PipelineError::TransformationError { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn outcome(item: &Item, error: Option<String>) -> RunOutcome {
    RunOutcome {
        item_id: item.id,
        status: item.status,
        stage_index: item.stage_index,
        error,
    }
}

fn parse_id(raw: &str) -> anyhow::Result<ItemId> {
    ItemId::parse(raw).with_context(|| format!("invalid item id: {}", raw))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
