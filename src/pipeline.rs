//! Per-data-source orchestration.
//!
//! Coordinates the full flow for each ingest variant: external extraction →
//! schema discovery → row import → (Amcache only) hash enrichment. Import
//! is best-effort throughout: a file whose working database never appears
//! is logged and skipped, and only configuration errors or a working
//! database that cannot be opened at all abort the run.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::bridge::{ToolInvocation, ToolRunner};
use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::db;
use crate::enrich::{EnrichmentScheduler, RunOutcome};
use crate::import;
use crate::progress::ProgressReporter;
use crate::schema;
use crate::store::SqliteStore;

/// The tables the hive parser is known to produce, imported in this order.
pub const AMCACHE_TABLES: [&str; 8] = [
    "root_file",
    "root_programs",
    "inventory_application_file",
    "inventory_device_container",
    "inventory_device_pnp",
    "inventory_driver_binary",
    "inventory_driver_package",
    "inventory_application_shortcut",
];

/// The hash-bearing tables whose rows are enriched.
pub const ENRICHMENT_TABLES: [&str; 2] = ["root_file", "inventory_application_file"];

/// Ingest one or more exported Amcache hive files, then enrich their file
/// hashes when a lookup key is configured.
pub async fn run_amcache(
    config: &Config,
    store: &SqliteStore,
    runner: &dyn ToolRunner,
    hive_files: &[PathBuf],
    cancel: &CancelFlag,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    std::fs::create_dir_all(&config.temp.dir)?;

    progress.switch_to_indeterminate("parsing");

    // Extraction and import, one file at a time.
    let mut working = Vec::new();
    for hive in hive_files {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        let db_path = working_db_path(&config.temp.dir, hive);
        let source_path = hive.display().to_string();

        let extract = ToolInvocation::Extract {
            input: hive.clone(),
            output_db: db_path.clone(),
        };
        if let Err(e) = runner.run(&extract).await {
            eprintln!("warning: skipping {}: {}", source_path, e);
            continue;
        }

        let pool = match db::open_working_db(&db_path).await {
            Ok(pool) => pool,
            Err(e) => {
                eprintln!("warning: skipping {}: {}", source_path, e);
                continue;
            }
        };

        let tables = schema::discover_tables(&pool, Some(&AMCACHE_TABLES)).await?;
        for table in tables {
            // A failing table is skipped; the rest of the file (and run)
            // continues.
            if let Err(e) = import_one_table(&pool, store, &source_path, &table, "Amcache").await {
                eprintln!("warning: skipping table '{}': {}", table, e);
            }
        }
        pool.close().await;

        working.push((db_path, source_path));
    }

    // Enrichment pass over the hash-bearing tables of each file.
    if !config.virustotal.is_enabled() {
        return Ok(RunOutcome::Completed);
    }

    progress.switch_to_indeterminate("enriching");
    let mut scheduler =
        EnrichmentScheduler::new(runner, store, &config.virustotal, cancel, progress);
    for (db_path, source_path) in &working {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        match scheduler
            .run(db_path, source_path, &ENRICHMENT_TABLES)
            .await?
        {
            RunOutcome::Completed => {}
            RunOutcome::Cancelled => return Ok(RunOutcome::Cancelled),
        }
    }

    Ok(RunOutcome::Completed)
}

/// Fetch CloudTrail logs into a working database and import every table
/// the fetcher produced, in name order.
pub async fn run_cloudtrail(
    config: &Config,
    store: &SqliteStore,
    runner: &dyn ToolRunner,
    cancel: &CancelFlag,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    let aws = config
        .aws
        .as_ref()
        .context("[aws] section is required for the cloudtrail command")?;
    crate::config::validate_aws(aws)?;

    std::fs::create_dir_all(&config.temp.dir)?;
    let db_path = config.temp.dir.join("cloudtrail.db");
    let source_path = format!("s3://{}", aws.bucket);

    progress.switch_to_indeterminate("fetching");
    let fetch = ToolInvocation::FetchLogs {
        access_key: aws.access_key.clone(),
        secret_key: aws.secret_key.clone(),
        region: aws.region.clone(),
        bucket: aws.bucket.clone(),
        output_db: db_path.clone(),
    };
    runner.run(&fetch).await?;

    // The fetch is the run's only unit of work, so an unusable database
    // here aborts rather than skips.
    let pool = db::open_working_db(&db_path).await?;

    let tables = schema::discover_tables(&pool, None).await?;
    progress.switch_to_determinate(tables.len() as u64);

    let mut count = 0u64;
    for table in tables {
        if cancel.is_cancelled() {
            pool.close().await;
            return Ok(RunOutcome::Cancelled);
        }

        if let Err(e) = import_one_table(&pool, store, &source_path, &table, "CloudTrail:").await {
            eprintln!("warning: skipping table '{}': {}", table, e);
        }

        count += 1;
        progress.progress(count);
    }
    pool.close().await;

    Ok(RunOutcome::Completed)
}

/// Map and import a single discovered table.
async fn import_one_table(
    pool: &sqlx::SqlitePool,
    store: &SqliteStore,
    source_path: &str,
    table: &str,
    description_prefix: &str,
) -> Result<()> {
    let source_table = schema::table_columns(pool, table).await?;
    let mapped = schema::map_table(store, source_table, description_prefix).await?;
    let imported = import::import_table(pool, store, source_path, &mapped).await?;
    println!("imported {}: {} artifacts", mapped.table.name, imported);
    Ok(())
}

/// Working-database path for an input file, derived from its stem to keep
/// concurrent data sources from colliding.
fn working_db_path(temp_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    temp_dir.join(format!("{}-amcache.db3", stem))
}
