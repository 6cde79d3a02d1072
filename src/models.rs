//! Core data types for the ingestion pipeline.
//!
//! These types represent the discovered source schema, the typed attribute
//! values derived from it, and the artifacts that flow into the store.

/// Storage kind of an attribute value.
///
/// The kind is decided once per attribute name, at first sight of the
/// column, from the external schema's declared column type. It never
/// changes for the lifetime of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Integer,
}

impl ValueKind {
    /// Stable string form used in the store database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Integer => "integer",
        }
    }

    /// Parse the stored string form back into a kind.
    pub fn parse(s: &str) -> Option<ValueKind> {
        match s {
            "text" => Some(ValueKind::Text),
            "integer" => Some(ValueKind::Integer),
            _ => None,
        }
    }
}

/// Classify a declared SQLite column type into a storage kind.
///
/// `"TEXT"` (any case) and the empty string are text; every other declared
/// type (the numeric affinities) is a 64-bit integer. Downstream query and
/// display behavior depends on this exact rule.
pub fn classify(declared_type: &str) -> ValueKind {
    if declared_type.is_empty() || declared_type.eq_ignore_ascii_case("TEXT") {
        ValueKind::Text
    } else {
        ValueKind::Integer
    }
}

/// Derive a catalog name from a source table or column name.
///
/// The fixed prefix plus the uppercased source name. Downstream consumers
/// look up types and attributes by this derived name, so the convention is
/// load-bearing.
pub fn catalog_name(source_name: &str) -> String {
    format!("TSK_{}", source_name.to_uppercase())
}

/// One column of a discovered table, in declaration order.
#[derive(Debug, Clone)]
pub struct SourceColumn {
    pub name: String,
    pub declared_type: String,
}

impl SourceColumn {
    pub fn kind(&self) -> ValueKind {
        classify(&self.declared_type)
    }
}

/// One table discovered in the working database. Discovered once per
/// processing pass via schema introspection; never mutated.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub name: String,
    pub columns: Vec<SourceColumn>,
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Integer(i64),
}

/// One attribute attached to an artifact, typed by a catalog entry.
#[derive(Debug, Clone)]
pub struct ArtifactAttribute {
    pub attribute_type_id: i64,
    pub value: AttrValue,
}

/// An artifact read back from the store, with its attributes resolved to
/// catalog names. Used by the host-facing query helpers and by tests.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub id: String,
    pub source_path: String,
    pub attributes: Vec<(String, AttrValue)>,
}
