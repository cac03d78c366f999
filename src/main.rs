//! # OAI Harvest CLI (`oaih`)
//!
//! The `oaih` binary drives harvest jobs declared in a TOML configuration
//! file: database setup, running and pausing harvests, clearing failed or
//! suspended jobs, and managing the item schemas and taxonomy nodes that
//! harvested records land in.
//!
//! ## Usage
//!
//! ```bash
//! oaih --config ./config/oaih.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `oaih init` | Create the SQLite database and register configured jobs |
//! | `oaih jobs` | List jobs with their state and checkpoint |
//! | `oaih run <job>` | Harvest a job; Ctrl-C pauses after the current page |
//! | `oaih clear <job>` | Reset a paused or failed job |
//! | `oaih status <job>` | Show a job's persisted run state |
//! | `oaih sets <job>` | List the remote repository's sets |
//! | `oaih preview <job> <id>` | Fetch and map a single record without storing it |
//! | `oaih schema import/list` | Manage item type schemas |
//! | `oaih index add/list` | Manage taxonomy nodes |

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use oai_harvest::commands;
use oai_harvest::config;
use oai_harvest::progress::ProgressMode;

/// OAI Harvest CLI: incremental OAI-PMH harvesting into a local catalog.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/oaih.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "oaih",
    about = "Incremental OAI-PMH harvester with schema-driven Dublin Core mapping",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/oaih.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and register configured jobs.
    ///
    /// Idempotent; safe to run after every configuration change.
    Init,

    /// List harvest jobs with their state, processed count and checkpoint.
    Jobs,

    /// Run a harvest job in the foreground.
    ///
    /// Resumes from the stored resumption token when the job was paused.
    /// Ctrl-C requests a pause that takes effect once the current page is
    /// checkpointed.
    Run {
        job: String,

        /// Progress output: `off`, `human` or `json` (stderr).
        /// Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Clear a paused or failed job so its next run starts from scratch.
    Clear {
        job: String,

        /// Also clear a job whose run lease looks stuck (e.g. after a crash).
        #[arg(long)]
        force: bool,
    },

    /// Show a job's persisted run state.
    Status { job: String },

    /// List the sets advertised by a job's repository.
    Sets { job: String },

    /// Fetch one record with GetRecord and print its mapped document.
    Preview { job: String, identifier: String },

    /// Manage item type schemas.
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// Manage taxonomy index nodes.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Import a JSON schema file for a resource category.
    Import {
        file: PathBuf,

        #[arg(long)]
        id: i64,

        /// Resource category, e.g. `Journal Article` or `Multiple`.
        #[arg(long)]
        category: String,

        /// RFC 3339 timestamp; defaults to now. The newest schema per
        /// category wins.
        #[arg(long, value_parser = parse_timestamp)]
        updated_at: Option<DateTime<Utc>>,
    },
    /// List stored schemas.
    List,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Create an index node.
    Add {
        name: String,

        #[arg(long)]
        parent: Option<i64>,

        #[arg(long, default_value = "")]
        browsing_role: String,

        #[arg(long, default_value = "")]
        contribute_role: String,
    },
    /// List the children of a node (root nodes by default).
    List {
        #[arg(long)]
        parent: Option<i64>,
    },
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s).ok_or_else(|| format!("invalid progress mode '{}' (off|human|json)", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
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
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Jobs => commands::list_jobs(&cfg).await?,
        Commands::Run { job, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_harvest(&cfg, &job, mode).await?;
        }
        Commands::Clear { job, force } => commands::run_clear(&cfg, &job, force).await?,
        Commands::Status { job } => commands::show_status(&cfg, &job).await?,
        Commands::Sets { job } => commands::list_remote_sets(&cfg, &job).await?,
        Commands::Preview { job, identifier } => {
            commands::preview_record(&cfg, &job, &identifier).await?;
        }
        Commands::Schema { action } => match action {
            SchemaAction::Import {
                file,
                id,
                category,
                updated_at,
            } => commands::import_schema(&cfg, &file, id, &category, updated_at).await?,
            SchemaAction::List => commands::list_schemas(&cfg).await?,
        },
        Commands::Index { action } => match action {
            IndexAction::Add {
                name,
                parent,
                browsing_role,
                contribute_role,
            } => {
                commands::add_index(&cfg, &name, parent, &browsing_role, &contribute_role).await?;
            }
            IndexAction::List { parent } => commands::list_indexes(&cfg, parent).await?,
        },
    }

    Ok(())
}
