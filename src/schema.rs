//! Schema discovery and catalog mapping.
//!
//! The external tool populates the working database with an a-priori-unknown
//! set of tables. This module introspects that schema and maps each table
//! onto the store's typed catalogs: one artifact type per table, one
//! attribute type per column, names derived by the fixed prefix convention.
//! Registration is idempotent, so re-discovering a table on a later pass
//! reuses the identifiers minted on the first.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{catalog_name, SourceColumn, SourceTable};
use crate::store::ArtifactSink;

/// A source table resolved against the catalogs: the artifact type id and
/// one attribute type id per column, in declared column order.
#[derive(Debug, Clone)]
pub struct MappedTable {
    pub table: SourceTable,
    pub artifact_type_id: i64,
    pub attribute_type_ids: Vec<i64>,
}

/// Discover table names in the working database.
///
/// With an allow-list, tables are returned in allow-list order, skipping
/// names the tool did not produce (matched case-insensitively, as the tool
/// is not consistent about casing). Without one, every user table is
/// returned ordered by name.
pub async fn discover_tables(pool: &SqlitePool, allow: Option<&[&str]>) -> Result<Vec<String>> {
    match allow {
        Some(names) => {
            let mut found = Vec::new();
            for name in names {
                let existing: Option<String> = sqlx::query_scalar(
                    "SELECT tbl_name FROM sqlite_master WHERE type = 'table' AND lower(tbl_name) = ?",
                )
                .bind(name.to_lowercase())
                .fetch_optional(pool)
                .await?;
                if let Some(table) = existing {
                    found.push(table);
                }
            }
            Ok(found)
        }
        None => {
            let rows = sqlx::query_scalar(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            )
            .fetch_all(pool)
            .await?;
            Ok(rows)
        }
    }
}

/// Read a table's columns in declaration order via `PRAGMA table_info`.
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<SourceTable> {
    let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table))
        .fetch_all(pool)
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let declared_type: String = row.try_get("type")?;
        columns.push(SourceColumn {
            name,
            declared_type,
        });
    }

    Ok(SourceTable {
        name: table.to_string(),
        columns,
    })
}

/// Register a discovered table and its columns in the catalogs.
///
/// `description` labels the artifact type for human consumption (e.g.
/// "Amcache ROOT_FILE"). Every registration goes through the idempotent
/// ensure operations, so a name that already exists resolves to its
/// original identifier and kind.
pub async fn map_table(
    sink: &dyn ArtifactSink,
    table: SourceTable,
    description_prefix: &str,
) -> Result<MappedTable> {
    let type_name = catalog_name(&table.name);
    let description = format!("{} {}", description_prefix, table.name.to_uppercase());
    let artifact_type_id = sink.ensure_artifact_type(&type_name, &description).await?;

    let mut attribute_type_ids = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        let attr_name = catalog_name(&column.name);
        let id = sink
            .ensure_attribute_type(&attr_name, column.kind(), &column.name)
            .await?;
        attribute_type_ids.push(id);
    }

    Ok(MappedTable {
        table,
        artifact_type_id,
        attribute_type_ids,
    })
}
