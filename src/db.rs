//! Working-database connections.
//!
//! The working database is a local SQLite file populated by the external
//! tool. It is opened read-only around each unit of work (one table import
//! or one enrichment read-back) and closed again, because the external tool
//! assumes exclusive access between invocations.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open a tool-produced working database.
///
/// Fails when the file does not exist or is not a SQLite database; the
/// caller decides whether that skips the unit of work or aborts the run.
pub async fn open_working_db(path: &Path) -> Result<SqlitePool> {
    if !path.exists() {
        anyhow::bail!(
            "working database {} was not produced by the external tool",
            path.display()
        );
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(false)
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Could not open working database {}", path.display()))?;

    Ok(pool)
}
