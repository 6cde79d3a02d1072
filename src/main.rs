//! # casebridge CLI
//!
//! Drives the ingest pipelines against the configured external tools.
//!
//! ## Usage
//!
//! ```bash
//! casebridge --config ./config/casebridge.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `casebridge init` | Create the artifact store database |
//! | `casebridge amcache <hive>...` | Parse hive files and enrich their hashes |
//! | `casebridge cloudtrail` | Fetch CloudTrail logs and import every table |
//!
//! Ctrl-C requests cooperative cancellation: the current unit of work
//! finishes, nothing new is started, and everything imported so far is
//! kept.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use casebridge::bridge::ExeRunner;
use casebridge::cancel::CancelFlag;
use casebridge::config;
use casebridge::enrich::RunOutcome;
use casebridge::pipeline;
use casebridge::progress::ProgressMode;
use casebridge::store::SqliteStore;

/// casebridge: ingest external forensic extractions into a typed
/// artifact store, with optional rate-limited hash enrichment.
#[derive(Parser)]
#[command(
    name = "casebridge",
    about = "Ingest external forensic extractions into a typed artifact store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/casebridge.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the artifact store database. Idempotent.
    Init,

    /// Parse exported Amcache hive files and enrich their file hashes.
    ///
    /// Each file is handed to the configured hive parser, the resulting
    /// working database is imported table by table, and, when a
    /// reputation lookup key is configured, every row of the
    /// hash-bearing tables is looked up, paced to the public quota
    /// unless the key is private.
    Amcache {
        /// Exported Amcache.hve files to process.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fetch CloudTrail logs from the configured bucket and import every
    /// table the fetcher produces.
    Cloudtrail,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let mode = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    let progress = mode.reporter();

    let store = SqliteStore::open(&cfg.store.path).await?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancellation requested, finishing current unit of work...");
                cancel.cancel();
            }
        });
    }

    let outcome = match cli.command {
        Commands::Init => {
            println!("Artifact store initialized.");
            store.close().await;
            return Ok(());
        }
        Commands::Amcache { files } => {
            let amcache = cfg
                .amcache
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[amcache] section is required"))?;
            let runner = ExeRunner::new(&amcache.exe)?;
            pipeline::run_amcache(&cfg, &store, &runner, &files, &cancel, progress.as_ref()).await?
        }
        Commands::Cloudtrail => {
            let cloudtrail = cfg
                .cloudtrail
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[cloudtrail] section is required"))?;
            let runner = ExeRunner::new(&cloudtrail.exe)?;
            pipeline::run_cloudtrail(&cfg, &store, &runner, &cancel, progress.as_ref()).await?
        }
    };

    store.close().await;

    match outcome {
        RunOutcome::Completed => println!("ok"),
        RunOutcome::Cancelled => println!("cancelled"),
    }

    Ok(())
}
