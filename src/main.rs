//! # gearflow CLI (`gflow`)
//!
//! The `gflow` binary drives the pipeline stores and the controller from
//! the command line.
//!
//! ## Usage
//!
//! ```bash
//! gflow --config ./config/gflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gflow init` | Create the SQLite database and schema |
//! | `gflow enqueue <file>` | Enqueue discoveries from a JSON file |
//! | `gflow queue peek\|stats\|dequeue\|update` | Inspect or edit the Discovery Queue |
//! | `gflow registry check\|register\|list\|stats` | Inspect or edit the Source Registry |
//! | `gflow research show\|validate` | Audit the Research Log |
//! | `gflow run` | Run one pipeline cycle and print the report |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); stdout carries only
//! command output, so `--json` output can be piped.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gearflow::config::{self, Config};
use gearflow::controller::Controller;
use gearflow::error::PipelineError;
use gearflow::models::{Discovery, ItemStatus, SourceKind};
use gearflow::queue::DiscoveryQueue;
use gearflow::registry::SourceRegistry;
use gearflow::report;
use gearflow::research::ResearchLog;
use gearflow::stats;
use gearflow::traits::Collaborators;
use gearflow::{db, migrate};

/// gearflow: durable discovery → research → commit pipeline coordination.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "gflow",
    about = "gearflow: durable discovery, research and commit pipeline coordination",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Enqueue discoveries from a JSON file (one object or an array).
    Enqueue {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Inspect or edit the Discovery Queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect or edit the Source Registry.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Audit the Research Log.
    Research {
        #[command(subcommand)]
        action: ResearchAction,
    },

    /// Run one pipeline cycle and print its report.
    ///
    /// Ctrl-C cancels the cycle between stages; a best-effort report is
    /// still printed.
    Run {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show the next pending items in serving order.
    Peek {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Counts by status and pending counts by kind.
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Claim the next pending item.
    Dequeue,
    /// Set an item's status.
    Update {
        id: String,
        /// One of pending, claimed, verified, committed, error.
        status: String,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Show what is known about a source.
    Check { url: String },
    /// Record one scan of a source.
    Register {
        url: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value = "0")]
        items: u32,
    },
    /// Most recently seen sources.
    List {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Totals and per-kind breakdown.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ResearchAction {
    /// All research sessions for an item, most recent first.
    Show {
        item_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Validate a completed research session.
    Validate { research_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Enqueue { file } => cmd_enqueue(&cfg, &file).await?,
        Commands::Queue { action } => cmd_queue(&cfg, action).await?,
        Commands::Registry { action } => cmd_registry(&cfg, action).await?,
        Commands::Research { action } => cmd_research(&cfg, action).await?,
        Commands::Run { json } => cmd_run(&cfg, json).await?,
    }

    Ok(())
}

async fn cmd_enqueue(cfg: &Config, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", file.display()))?;
    let discoveries: Vec<Discovery> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };

    let pool = db::connect(cfg).await?;
    let queue = DiscoveryQueue::new(pool.clone());

    let (mut queued, mut duplicates) = (0usize, 0usize);
    for discovery in &discoveries {
        match queue.enqueue(discovery).await {
            Ok(_) => queued += 1,
            Err(PipelineError::Duplicate { id, status }) => {
                duplicates += 1;
                eprintln!("  skipped duplicate {} ({})", id, status);
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("Enqueued {} item(s), {} duplicate(s) skipped.", queued, duplicates);
    pool.close().await;
    Ok(())
}

async fn cmd_queue(cfg: &Config, action: QueueAction) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let queue = DiscoveryQueue::new(pool.clone());

    match action {
        QueueAction::Peek { limit, json } => {
            let items = queue.peek(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                stats::print_items(&items);
            }
        }
        QueueAction::Stats { json } => {
            let s = queue.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                stats::print_queue_stats(&s);
            }
        }
        QueueAction::Dequeue => match queue.dequeue().await {
            Ok(item) => stats::print_item(&item),
            Err(PipelineError::Empty) => println!("Queue is empty."),
            Err(e) => return Err(e.into()),
        },
        QueueAction::Update { id, status } => {
            let status: ItemStatus = status.parse()?;
            queue.update_status(&id, status).await?;
            println!("{} → {}", id, status);
        }
    }

    pool.close().await;
    Ok(())
}

async fn cmd_registry(cfg: &Config, action: RegistryAction) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = SourceRegistry::new(pool.clone());

    match action {
        RegistryAction::Check { url } => match registry.check(&url).await? {
            Some(visit) => stats::print_visit(&visit),
            None => println!("unknown: {}", url),
        },
        RegistryAction::Register { url, kind, items } => {
            let kind: Option<SourceKind> = kind.as_deref().map(str::parse).transpose()?;
            let visit = registry.register(&url, kind, items).await?;
            stats::print_visit(&visit);
        }
        RegistryAction::List { limit } => {
            let visits = registry.list(limit).await?;
            stats::print_sources(&visits);
        }
        RegistryAction::Stats { json } => {
            let s = registry.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                stats::print_registry_stats(&s);
            }
        }
    }

    pool.close().await;
    Ok(())
}

async fn cmd_research(cfg: &Config, action: ResearchAction) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let log = ResearchLog::new(pool.clone());

    match action {
        ResearchAction::Show { item_id, json } => {
            let audits = log.retrieve(&item_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&audits)?);
            } else {
                stats::print_audit(&item_id, &audits);
            }
        }
        ResearchAction::Validate { research_id } => {
            let validation = log
                .validate_against(&research_id, cfg.pipeline.quality_threshold)
                .await?;
            stats::print_validation(&validation);
        }
    }

    pool.close().await;
    Ok(())
}

async fn cmd_run(cfg: &Config, json: bool) -> Result<()> {
    let collaborators = Collaborators::from_config(cfg)?;
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling after the current step");
            on_signal.cancel();
        }
    });

    let mut controller = Controller::new(pool.clone(), cfg, collaborators);
    let run = controller.run_cycle(&cancel).await?;

    if json {
        println!("{}", run.to_json()?);
    } else {
        report::print_report(&run);
    }

    pool.close().await;
    Ok(())
}
