//! # Case Ingest CLI (`caseingest`)
//!
//! ## Usage
//!
//! ```bash
//! caseingest --config ./config/cases.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `caseingest init` | Create the SQLite database and run schema migrations |
//! | `caseingest ingest <case-id>...` | Run the case ingestion job for the given cases |
//! | `caseingest verify once` | Run a single verification poll |
//! | `caseingest verify run` | Run the verification scheduler until Ctrl-C |
//! | `caseingest tasks` | List verification tasks |
//! | `caseingest requeue <task-id>` | Give a failed task a fresh attempt budget |
//! | `caseingest ready` | List documents ready for answer generation |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use case_ingest::{app, config, migrate, status};

/// Case Ingest: court-case document ingestion with verified hand-off to
/// answer generation.
#[derive(Parser)]
#[command(name = "caseingest", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cases.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Discover, resolve, upload, and enqueue the materials of one or more
    /// cases.
    Ingest {
        /// Case ids to ingest.
        #[arg(required = true)]
        case_ids: Vec<String>,
    },

    /// Confirm ingestion of uploaded documents.
    Verify {
        #[command(subcommand)]
        action: VerifyAction,
    },

    /// List verification tasks.
    Tasks {
        /// Only show tasks in this status (pending, in_progress,
        /// succeeded, failed).
        #[arg(long)]
        status: Option<String>,
    },

    /// Return a FAILED verification task to PENDING.
    Requeue {
        task_id: String,
    },

    /// List the latest INGESTED document per case material.
    Ready {
        /// Restrict to these case ids (repeatable).
        #[arg(long = "case")]
        case_ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VerifyAction {
    /// Run one poll and exit.
    Once,
    /// Poll on the configured delay until interrupted.
    Run,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { case_ids } => {
            app::run_ingest(cfg, case_ids).await?;
        }
        Commands::Verify { action } => match action {
            VerifyAction::Once => app::run_verify_once(cfg).await?,
            VerifyAction::Run => app::run_verify_loop(cfg).await?,
        },
        Commands::Tasks { status: filter } => {
            status::run_tasks(&cfg, filter).await?;
        }
        Commands::Requeue { task_id } => {
            status::run_requeue(&cfg, &task_id).await?;
        }
        Commands::Ready { case_ids } => {
            status::run_ready(&cfg, case_ids).await?;
        }
    }

    Ok(())
}
