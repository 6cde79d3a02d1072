//! Hash enrichment scheduling.
//!
//! For each hash-bearing table the external tool is invoked once per row,
//! keyed by the 1-based positional primary key. Each lookup is a full
//! synchronous round trip: invoke the tool, reopen the working database,
//! read back the one newly populated verdict row, and convert it into an
//! artifact. Re-querying a single key per round trip is the defining
//! mechanism here: it keeps each external call within the rate limit.
//!
//! Under a public (quota-limited) key the scheduler enforces a floor of
//! fifteen seconds between the starts of successive lookups; a private key
//! skips the pacing entirely. Cancellation is polled before the sleep and
//! before each lookup; a cancelled run is a distinct outcome, not an error,
//! and everything imported so far stays valid. There is no cross-run resume
//! cursor; a cancelled run restarts from key 1.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::bridge::{ToolInvocation, ToolRunner};
use crate::cancel::CancelFlag;
use crate::config::VirusTotalConfig;
use crate::db;
use crate::import;
use crate::models::{catalog_name, classify, SourceColumn, SourceTable};
use crate::progress::ProgressReporter;
use crate::schema::MappedTable;
use crate::store::ArtifactSink;

/// Minimum interval between successive lookup starts under a public key
/// (four requests a minute).
pub const PUBLIC_LOOKUP_GAP: Duration = Duration::from_secs(15);

/// Suffix the external tool appends to a source table's name for its
/// verdict table.
const SCAN_TABLE_SUFFIX: &str = "_virustotal_scan";

/// The fixed shape of a verdict table. Before enrichment only the first
/// three columns are populated; the lookup fills in the rest.
const SCAN_COLUMNS: [(&str, &str); 6] = [
    ("p_key", "int"),
    ("file", "text"),
    ("sha1", "text"),
    ("vt_positives", "int"),
    ("vt_ratio", "text"),
    ("vt_report_link", "text"),
];

/// How an enrichment (or ingest) run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Enforces the minimum gap between lookup starts.
///
/// The gap is measured from the start of the just-completed lookup, so the
/// sleep is only the remainder of the window (clamped to zero when the
/// round trip itself took longer than the window).
#[derive(Debug)]
pub struct Pacer {
    min_gap: Duration,
    last_start: Option<Instant>,
}

impl Pacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_start: None,
        }
    }

    /// Record that a lookup is starting now.
    pub fn mark_start(&mut self) {
        self.last_start = Some(Instant::now());
    }

    /// Sleep out the remainder of the window since the last marked start.
    pub async fn wait_remainder(&self) {
        if let Some(start) = self.last_start {
            let elapsed = start.elapsed();
            if elapsed < self.min_gap {
                sleep(self.min_gap - elapsed).await;
            }
        }
    }
}

/// Drives the per-key lookup loop over the hash-bearing tables of one
/// working database.
pub struct EnrichmentScheduler<'a> {
    runner: &'a dyn ToolRunner,
    sink: &'a dyn ArtifactSink,
    credentials: &'a VirusTotalConfig,
    cancel: &'a CancelFlag,
    progress: &'a dyn ProgressReporter,
    lookup_gap: Duration,
    completed: u64,
}

impl<'a> EnrichmentScheduler<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        sink: &'a dyn ArtifactSink,
        credentials: &'a VirusTotalConfig,
        cancel: &'a CancelFlag,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            runner,
            sink,
            credentials,
            cancel,
            progress,
            lookup_gap: PUBLIC_LOOKUP_GAP,
            completed: 0,
        }
    }

    /// Override the public-key pacing gap.
    pub fn with_lookup_gap(mut self, gap: Duration) -> Self {
        self.lookup_gap = gap;
        self
    }

    /// Enrich every row of the named tables in `db_path`, in order.
    ///
    /// The progress total is fixed up front to the sum of the tables' row
    /// counts and one shared counter advances across all of them. Tables
    /// the tool did not produce contribute zero rows.
    pub async fn run(
        &mut self,
        db_path: &Path,
        source_path: &str,
        tables: &[&str],
    ) -> Result<RunOutcome> {
        let mut counts = Vec::with_capacity(tables.len());
        {
            let pool = db::open_working_db(db_path).await?;
            for table in tables {
                counts.push(count_rows(&pool, table).await?);
            }
            pool.close().await;
        }

        let total: i64 = counts.iter().sum();
        self.completed = 0;
        self.progress.switch_to_determinate(total as u64);

        // One pacer for the whole run, so the gap is enforced across table
        // boundaries too.
        let mut pacer = (!self.credentials.private_key).then(|| Pacer::new(self.lookup_gap));

        for (table, rows) in tables.iter().zip(counts) {
            match self
                .scan_table(db_path, source_path, table, rows, &mut pacer)
                .await?
            {
                RunOutcome::Completed => {}
                RunOutcome::Cancelled => return Ok(RunOutcome::Cancelled),
            }
        }

        Ok(RunOutcome::Completed)
    }

    async fn scan_table(
        &mut self,
        db_path: &Path,
        source_path: &str,
        table: &str,
        rows: i64,
        pacer: &mut Option<Pacer>,
    ) -> Result<RunOutcome> {
        if rows == 0 {
            return Ok(RunOutcome::Completed);
        }

        // The catalog entries are ensured up front, before any lookup has a
        // chance to fail.
        let scan_table = format!("{}{}", table, SCAN_TABLE_SUFFIX);
        let mapped = ensure_scan_catalog(self.sink, &scan_table).await?;

        for key in 1..=rows {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            // Sleep out the remainder of the previous lookup's window, then
            // re-check cancellation before committing to the next lookup.
            if let Some(p) = pacer.as_mut() {
                p.wait_remainder().await;
                if self.cancel.is_cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                p.mark_start();
            }

            let lookup = ToolInvocation::Lookup {
                db: db_path.to_path_buf(),
                api_key: self.credentials.api_key.clone(),
                table: table.to_string(),
                key,
            };
            if let Err(e) = self.runner.run(&lookup).await {
                eprintln!("warning: lookup {} of '{}' failed: {}", key, table, e);
            } else {
                let pool = db::open_working_db(db_path).await?;
                if let Err(e) = import_verdict(&pool, self.sink, source_path, &mapped, key).await {
                    eprintln!(
                        "warning: could not import verdict {} of '{}': {}",
                        key, scan_table, e
                    );
                }
                pool.close().await;
            }

            self.completed += 1;
            self.progress.progress(self.completed);
        }

        Ok(RunOutcome::Completed)
    }
}

/// Count the rows of `table`, treating a missing table as empty.
pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND lower(tbl_name) = ?",
    )
    .bind(table.to_lowercase())
    .fetch_one(pool)
    .await?;
    if exists == 0 {
        return Ok(0);
    }

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Ensure the verdict artifact type and its six attribute types exist,
/// using the same idempotent registration as plain schema mapping.
async fn ensure_scan_catalog(sink: &dyn ArtifactSink, scan_table: &str) -> Result<MappedTable> {
    let columns: Vec<SourceColumn> = SCAN_COLUMNS
        .iter()
        .map(|(name, declared)| SourceColumn {
            name: name.to_string(),
            declared_type: declared.to_string(),
        })
        .collect();

    let type_name = catalog_name(scan_table);
    let description = format!("Amcache {}", scan_table.to_uppercase());
    let artifact_type_id = sink.ensure_artifact_type(&type_name, &description).await?;

    let mut attribute_type_ids = Vec::with_capacity(columns.len());
    for column in &columns {
        let id = sink
            .ensure_attribute_type(
                &catalog_name(&column.name),
                classify(&column.declared_type),
                &column.name,
            )
            .await?;
        attribute_type_ids.push(id);
    }

    Ok(MappedTable {
        table: SourceTable {
            name: scan_table.to_string(),
            columns,
        },
        artifact_type_id,
        attribute_type_ids,
    })
}

/// Read back the verdict row for one key and convert it into an artifact.
///
/// Zero rows is not an error (the lookup may have produced nothing for
/// this key), and each imported row posts one data event.
async fn import_verdict(
    pool: &SqlitePool,
    sink: &dyn ArtifactSink,
    source_path: &str,
    mapped: &MappedTable,
    key: i64,
) -> Result<()> {
    let select = format!(
        "SELECT \"p_key\", \"file\", \"sha1\", \"vt_positives\", \"vt_ratio\", \"vt_report_link\" FROM \"{}\" WHERE p_key = ?",
        mapped.table.name
    );
    let rows = sqlx::query(&select).bind(key).fetch_all(pool).await?;

    for row in &rows {
        let attributes = import::decode_row(row, mapped)?;
        sink.add_artifact(source_path, mapped.artifact_type_id, attributes)
            .await?;
        sink.post_data_event(mapped.artifact_type_id).await?;
    }

    Ok(())
}
