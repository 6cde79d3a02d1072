//! Row import: one artifact per source row.
//!
//! Streams every row of a mapped table and materializes one artifact per
//! row, attributes in the table's declared column order, values decoded per
//! the column's classified kind. Import is best-effort: a row that fails to
//! decode is logged and skipped, and the rest of the table (and run)
//! continues. One data event is posted per table, after all of its rows.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{ArtifactAttribute, AttrValue, ValueKind};
use crate::schema::MappedTable;
use crate::store::ArtifactSink;

/// Import every row of `mapped` into the sink. Returns the number of
/// artifacts created.
pub async fn import_table(
    pool: &SqlitePool,
    sink: &dyn ArtifactSink,
    source_path: &str,
    mapped: &MappedTable,
) -> Result<u64> {
    let rows = sqlx::query(&format!("SELECT * FROM \"{}\"", mapped.table.name))
        .fetch_all(pool)
        .await?;

    let mut imported = 0u64;
    for (row_index, row) in rows.iter().enumerate() {
        match decode_row(row, mapped) {
            Ok(attributes) => {
                sink.add_artifact(source_path, mapped.artifact_type_id, attributes)
                    .await?;
                imported += 1;
            }
            Err(e) => {
                eprintln!(
                    "warning: skipping row {} of table '{}': {}",
                    row_index + 1,
                    mapped.table.name,
                    e
                );
            }
        }
    }

    // One per-table completion event, not one per row.
    sink.post_data_event(mapped.artifact_type_id).await?;

    Ok(imported)
}

/// Decode one row into attributes, in declared column order.
///
/// Text columns pass the textual value through (NULL becomes the empty
/// string); integer columns convert to `i64` (NULL becomes zero). A value
/// that cannot be decoded as its column's kind fails the whole row.
pub fn decode_row(row: &SqliteRow, mapped: &MappedTable) -> Result<Vec<ArtifactAttribute>> {
    let mut attributes = Vec::with_capacity(mapped.table.columns.len());
    for (index, column) in mapped.table.columns.iter().enumerate() {
        let value = match column.kind() {
            ValueKind::Text => {
                let v: Option<String> = row.try_get(index)?;
                AttrValue::Text(v.unwrap_or_default())
            }
            ValueKind::Integer => {
                let v: Option<i64> = row.try_get(index)?;
                AttrValue::Integer(v.unwrap_or(0))
            }
        };
        attributes.push(ArtifactAttribute {
            attribute_type_id: mapped.attribute_type_ids[index],
            value,
        });
    }
    Ok(attributes)
}
