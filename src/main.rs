//! # QE Context CLI (`qectx`)
//!
//! Command-line front end for the context engine: schema setup, local
//! record import, semantic retrieval, stratified sampling, analysis through
//! the generation pool, and the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! qectx --config ./config/qectx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qectx init` | Create the SQLite database and run schema migrations |
//! | `qectx import <file>` | Import JSON / JSONL records, embed and store them |
//! | `qectx context "<query>"` | Semantic retrieval, prints the context block |
//! | `qectx sample` | Stratified sample of a filtered scope |
//! | `qectx analyze "<query>" --task "..."` | Retrieval plus text generation |
//! | `qectx serve` | Start the HTTP API |
//! | `qectx check-config` | Validate config and print value warnings |
//!
//! ## Examples
//!
//! ```bash
//! qectx init
//! qectx import ./data/defects.jsonl --type defect
//! qectx context "payment declined at checkout" --types defect,requirement --max-chars 6000
//! qectx sample --types defect --severity critical --severity high --since 2024-01-01 --json
//! qectx analyze "checkout" --task "Summarize recurring failure modes"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use qe_context::config::SharedConfig;
use qe_context::context_cmd::{self, OutputOptions, SampleFilters};
use qe_context::{ingest, logging, migrate, server};
use qe_context_core::models::SourceType;

/// QE Context: retrieval, sampling and prompt assembly for AI-assisted
/// quality engineering.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/qectx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qectx",
    about = "QE Context: retrieval, sampling and prompt assembly for AI-assisted quality engineering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qectx.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by retrieval commands.
#[derive(clap::Args, Debug, Clone, Default)]
struct RetrievalArgs {
    /// Comma-separated source types (requirement, defect, test_case, document, document_section).
    #[arg(long)]
    types: Option<String>,

    /// Only records created on or after this date (YYYY-MM-DD).
    #[arg(long)]
    since: Option<String>,

    /// Only records created on or before this date (YYYY-MM-DD).
    #[arg(long)]
    until: Option<String>,

    /// Override the total context budget, in characters.
    #[arg(long)]
    max_chars: Option<i64>,

    /// Print the full JSON response instead of the context text.
    #[arg(long)]
    json: bool,
}

impl From<RetrievalArgs> for OutputOptions {
    fn from(a: RetrievalArgs) -> Self {
        OutputOptions {
            types: a.types,
            since: a.since,
            until: a.until,
            max_chars: a.max_chars,
            json: a.json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Import records from a JSON array or JSON-Lines file.
    Import {
        /// Path to the `.json` or `.jsonl` file.
        file: PathBuf,

        /// Source type for records that do not name one.
        #[arg(long = "type")]
        source_type: Option<SourceType>,
    },

    /// Retrieve context for a free-text query.
    Context {
        query: String,

        #[command(flatten)]
        args: RetrievalArgs,
    },

    /// Stratified sample of the records matching the given filters.
    Sample {
        /// Severity band (repeatable; accepts aliases such as `blocker`, `major`).
        #[arg(long)]
        severity: Vec<String>,

        /// Component name (repeatable, case-insensitive).
        #[arg(long)]
        component: Vec<String>,

        /// Status value (repeatable, case-insensitive).
        #[arg(long)]
        status: Vec<String>,

        #[command(flatten)]
        args: RetrievalArgs,
    },

    /// Retrieve context, then run one or more tasks through the generation pool.
    Analyze {
        query: String,

        /// Analysis instructions (repeatable; results print in order).
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,

        #[command(flatten)]
        args: RetrievalArgs,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Load the config file and print its effective values and warnings.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json);

    if let Commands::CheckConfig = cli.command {
        return context_cmd::run_check_config(&cli.config);
    }

    let shared = Arc::new(SharedConfig::load(&cli.config)?);
    let cfg = shared.current();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { file, source_type } => {
            ingest::run_import(&cfg, &file, source_type).await?;
        }
        Commands::Context { query, args } => {
            context_cmd::run_context(&cfg, &query, &args.into()).await?;
        }
        Commands::Sample {
            severity,
            component,
            status,
            args,
        } => {
            let flags = SampleFilters {
                severity,
                component,
                status,
            };
            context_cmd::run_sample(&cfg, &flags, &args.into()).await?;
        }
        Commands::Analyze { query, tasks, args } => {
            context_cmd::run_analyze(&cfg, &query, &tasks, &args.into()).await?;
        }
        Commands::Serve => {
            server::run_server(shared.clone()).await?;
        }
        Commands::CheckConfig => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
