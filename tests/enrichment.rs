//! Enrichment scheduler tests.
//!
//! A fake lookup tool writes verdict rows into the working database the
//! same way the real client does, so the scheduler's per-key round trips,
//! pacing, progress, and cancellation can be observed end-to-end.

use anyhow::Result;
use async_trait::async_trait;
use casebridge::bridge::{ToolInvocation, ToolRunner};
use casebridge::cancel::CancelFlag;
use casebridge::config::VirusTotalConfig;
use casebridge::enrich::{EnrichmentScheduler, RunOutcome};
use casebridge::models::{AttrValue, ValueKind};
use casebridge::progress::ProgressReporter;
use casebridge::store::SqliteStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ─── Fakes ──────────────────────────────────────────────────────────

async fn open_writable(path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true);
    SqlitePool::connect_with(options).await.unwrap()
}

/// Fabricate a working database with hash-bearing tables of the given row
/// counts.
async fn fabricate_working_db(path: &Path, tables: &[(&str, i64)]) {
    let pool = open_writable(path).await;
    for (table, rows) in tables {
        sqlx::query(&format!(
            "CREATE TABLE \"{}\" (name TEXT, sha1 TEXT)",
            table
        ))
        .execute(&pool)
        .await
        .unwrap();
        for key in 1..=*rows {
            sqlx::query(&format!(
                "INSERT INTO \"{}\" (name, sha1) VALUES (?, ?)",
                table
            ))
            .bind(format!("file{}.exe", key))
            .bind(format!("da39a3ee5e6b4b0d3255bfef95601890afd8{:04}", key))
            .execute(&pool)
            .await
            .unwrap();
        }
    }
    pool.close().await;
}

/// Stands in for the lookup client: each `Lookup` appends one verdict row
/// to the table's scan table, like the real tool does.
struct FakeLookupTool {
    invocations: Mutex<Vec<ToolInvocation>>,
    /// Keys whose lookup fails instead of producing a verdict.
    fail_keys: Vec<i64>,
    /// Cancel this flag once the given number of lookups have run.
    cancel_after: Option<(usize, CancelFlag)>,
}

impl FakeLookupTool {
    fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            fail_keys: Vec::new(),
            cancel_after: None,
        }
    }

    fn lookup_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolRunner for FakeLookupTool {
    async fn run(&self, invocation: &ToolInvocation) -> Result<()> {
        let (db, table, key) = match invocation {
            ToolInvocation::Lookup { db, table, key, .. } => (db.clone(), table.clone(), *key),
            other => anyhow::bail!("unexpected invocation: {:?}", other),
        };

        let count = {
            let mut log = self.invocations.lock().unwrap();
            log.push(invocation.clone());
            log.len()
        };
        if let Some((after, flag)) = &self.cancel_after {
            if count >= *after {
                flag.cancel();
            }
        }

        if self.fail_keys.contains(&key) {
            anyhow::bail!("simulated lookup failure");
        }

        let pool = open_writable(&db).await;
        let scan_table = format!("{}_virustotal_scan", table);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (p_key int, file text, sha1 text, vt_positives int, vt_ratio text, vt_report_link text)",
            scan_table
        ))
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(&format!(
            "INSERT INTO \"{}\" VALUES (?, ?, ?, ?, ?, ?)",
            scan_table
        ))
        .bind(key)
        .bind(format!("file{}.exe", key))
        .bind(format!("da39a3ee5e6b4b0d3255bfef95601890afd8{:04}", key))
        .bind(key)
        .bind(format!("{}/70", key))
        .bind(format!("https://www.virustotal.com/report/{}", key))
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
        Ok(())
    }
}

/// Records every progress call for assertion.
#[derive(Default)]
struct RecordingProgress {
    totals: Mutex<Vec<u64>>,
    ticks: Mutex<Vec<u64>>,
}

impl ProgressReporter for RecordingProgress {
    fn switch_to_indeterminate(&self, _phase: &str) {}
    fn switch_to_determinate(&self, total: u64) {
        self.totals.lock().unwrap().push(total);
    }
    fn progress(&self, n: u64) {
        self.ticks.lock().unwrap().push(n);
    }
}

fn private_credentials() -> VirusTotalConfig {
    VirusTotalConfig {
        api_key: "test-key".to_string(),
        private_key: true,
    }
}

// ─── Scheduler behavior ─────────────────────────────────────────────

#[tokio::test]
async fn private_key_enriches_every_row_of_every_table() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    fabricate_working_db(&db_path, &[("root_file", 3), ("inventory_application_file", 2)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let runner = FakeLookupTool::new();
    let credentials = private_credentials();
    let cancel = CancelFlag::new();
    let progress = RecordingProgress::default();

    let mut scheduler =
        EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress);
    let outcome = scheduler
        .run(
            &db_path,
            "/evidence/Amcache.hve",
            &["root_file", "inventory_application_file"],
        )
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(runner.lookup_count(), 5);

    // Keys run in order within each table, tables in the given order.
    let invocations = runner.invocations.lock().unwrap();
    let keys: Vec<(String, i64)> = invocations
        .iter()
        .map(|inv| match inv {
            ToolInvocation::Lookup { table, key, .. } => (table.clone(), *key),
            other => panic!("unexpected invocation: {:?}", other),
        })
        .collect();
    assert_eq!(
        keys,
        vec![
            ("root_file".to_string(), 1),
            ("root_file".to_string(), 2),
            ("root_file".to_string(), 3),
            ("inventory_application_file".to_string(), 1),
            ("inventory_application_file".to_string(), 2),
        ]
    );
    drop(invocations);

    // One shared counter over the summed total.
    assert_eq!(*progress.totals.lock().unwrap(), vec![5]);
    assert_eq!(*progress.ticks.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    let verdicts = store
        .artifacts_of_type("TSK_ROOT_FILE_VIRUSTOTAL_SCAN")
        .await
        .unwrap();
    assert_eq!(verdicts.len(), 3);
    assert_eq!(
        verdicts[0].attributes,
        vec![
            ("TSK_P_KEY".to_string(), AttrValue::Integer(1)),
            ("TSK_FILE".to_string(), AttrValue::Text("file1.exe".to_string())),
            (
                "TSK_SHA1".to_string(),
                AttrValue::Text("da39a3ee5e6b4b0d3255bfef95601890afd80001".to_string())
            ),
            ("TSK_VT_POSITIVES".to_string(), AttrValue::Integer(1)),
            ("TSK_VT_RATIO".to_string(), AttrValue::Text("1/70".to_string())),
            (
                "TSK_VT_REPORT_LINK".to_string(),
                AttrValue::Text("https://www.virustotal.com/report/1".to_string())
            ),
        ]
    );
    // One data event per imported verdict row.
    assert_eq!(
        store.data_event_count("TSK_ROOT_FILE_VIRUSTOTAL_SCAN").await.unwrap(),
        3
    );
    assert_eq!(
        store
            .artifacts_of_type("TSK_INVENTORY_APPLICATION_FILE_VIRUSTOTAL_SCAN")
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn missing_tables_contribute_zero_rows() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    // Only root_file exists; the second table was never produced.
    fabricate_working_db(&db_path, &[("root_file", 2)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let runner = FakeLookupTool::new();
    let credentials = private_credentials();
    let cancel = CancelFlag::new();
    let progress = RecordingProgress::default();

    let mut scheduler =
        EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress);
    let outcome = scheduler
        .run(&db_path, "src", &["root_file", "inventory_application_file"])
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(runner.lookup_count(), 2);
    assert_eq!(*progress.totals.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn failed_lookups_are_skipped_but_still_counted() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    fabricate_working_db(&db_path, &[("root_file", 3)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let mut runner = FakeLookupTool::new();
    runner.fail_keys = vec![2];
    let credentials = private_credentials();
    let cancel = CancelFlag::new();
    let progress = RecordingProgress::default();

    let mut scheduler =
        EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress);
    let outcome = scheduler.run(&db_path, "src", &["root_file"]).await.unwrap();

    // Key 2 produced no verdict, keys 1 and 3 did; progress still covers
    // every key.
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(runner.lookup_count(), 3);
    assert_eq!(
        store
            .artifacts_of_type("TSK_ROOT_FILE_VIRUSTOTAL_SCAN")
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(*progress.ticks.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn scan_catalog_is_registered_even_when_the_first_lookup_fails() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    fabricate_working_db(&db_path, &[("root_file", 1)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let mut runner = FakeLookupTool::new();
    runner.fail_keys = vec![1];
    let credentials = private_credentials();
    let cancel = CancelFlag::new();
    let progress = RecordingProgress::default();

    let mut scheduler =
        EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress);
    let outcome = scheduler.run(&db_path, "src", &["root_file"]).await.unwrap();

    // No verdict was ever produced, but the catalog entries exist with
    // their declared kinds.
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(store
        .artifact_type_id("TSK_ROOT_FILE_VIRUSTOTAL_SCAN")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        store.attribute_kind("TSK_VT_POSITIVES").await.unwrap(),
        Some(ValueKind::Integer)
    );
    assert_eq!(
        store.attribute_kind("TSK_VT_RATIO").await.unwrap(),
        Some(ValueKind::Text)
    );
    assert!(store
        .artifacts_of_type("TSK_ROOT_FILE_VIRUSTOTAL_SCAN")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cancellation_stops_before_the_next_lookup() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    fabricate_working_db(&db_path, &[("root_file", 3)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let cancel = CancelFlag::new();
    let mut runner = FakeLookupTool::new();
    runner.cancel_after = Some((2, cancel.clone()));
    let credentials = private_credentials();
    let progress = RecordingProgress::default();

    let mut scheduler =
        EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress);
    let outcome = scheduler.run(&db_path, "src", &["root_file"]).await.unwrap();

    // The in-flight unit of work finishes, the third never starts, and
    // everything imported so far is kept.
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(runner.lookup_count(), 2);
    assert_eq!(
        store
            .artifacts_of_type("TSK_ROOT_FILE_VIRUSTOTAL_SCAN")
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(*progress.ticks.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn public_key_paces_successive_lookup_starts() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    fabricate_working_db(&db_path, &[("root_file", 3)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let runner = FakeLookupTool::new();
    let credentials = VirusTotalConfig {
        api_key: "test-key".to_string(),
        private_key: false,
    };
    let cancel = CancelFlag::new();
    let progress = RecordingProgress::default();

    // A shortened gap; the production default is PUBLIC_LOOKUP_GAP.
    let gap = Duration::from_millis(250);
    let begin = Instant::now();
    let mut scheduler = EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress)
        .with_lookup_gap(gap);
    let outcome = scheduler.run(&db_path, "src", &["root_file"]).await.unwrap();
    let elapsed = begin.elapsed();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(runner.lookup_count(), 3);
    // Three lookups means two enforced inter-lookup gaps.
    assert!(
        elapsed >= 2 * gap,
        "expected at least two pacing gaps, got {:?}",
        elapsed
    );
}

#[tokio::test]
async fn pacing_spans_table_boundaries() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("work.db3");
    fabricate_working_db(&db_path, &[("root_file", 1), ("inventory_application_file", 1)]).await;

    let store = SqliteStore::open(&tmp.path().join("store.db")).await.unwrap();
    let runner = FakeLookupTool::new();
    let credentials = VirusTotalConfig {
        api_key: "test-key".to_string(),
        private_key: false,
    };
    let cancel = CancelFlag::new();
    let progress = RecordingProgress::default();

    let gap = Duration::from_millis(250);
    let begin = Instant::now();
    let mut scheduler = EnrichmentScheduler::new(&runner, &store, &credentials, &cancel, &progress)
        .with_lookup_gap(gap);
    let outcome = scheduler
        .run(&db_path, "src", &["root_file", "inventory_application_file"])
        .await
        .unwrap();

    // One key per table: the single gap sits between the two tables.
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(runner.lookup_count(), 2);
    assert!(
        begin.elapsed() >= gap,
        "expected the gap to hold across the table boundary, got {:?}",
        begin.elapsed()
    );
}
