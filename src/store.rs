//! Artifact store: the generic typed catalogs plus artifact persistence.
//!
//! The store holds two lazily populated catalogs (artifact types keyed by
//! name, attribute types keyed by name with a fixed value kind) and the
//! artifacts created against them. Registration is an idempotent upsert:
//! registering a name that already exists returns the existing identifier
//! instead of failing, which is the expected outcome on every pass after
//! the first.
//!
//! Data events mirror the host framework's per-table "new artifacts
//! available" notification; they are recorded so the host (and tests) can
//! observe exactly when they fired.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{ArtifactAttribute, AttrValue, StoredArtifact, ValueKind};

/// Where artifacts, catalog registrations, and data events go.
///
/// The pipelines only ever talk to this trait, so tests (or an embedding
/// host) can substitute their own sink.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Register an artifact type, returning the existing id when the name
    /// is already known. Never fails on a duplicate name.
    async fn ensure_artifact_type(&self, name: &str, description: &str) -> Result<i64>;

    /// Register an attribute type. The kind recorded at first registration
    /// wins; later calls return the original id regardless of the kind
    /// they pass.
    async fn ensure_attribute_type(
        &self,
        name: &str,
        kind: ValueKind,
        display_name: &str,
    ) -> Result<i64>;

    /// Create one artifact with its attributes, in the given order.
    async fn add_artifact(
        &self,
        source_path: &str,
        artifact_type_id: i64,
        attributes: Vec<ArtifactAttribute>,
    ) -> Result<String>;

    /// Signal that new artifacts of a type are available.
    async fn post_data_event(&self, artifact_type_id: i64) -> Result<()>;
}

/// SQLite-backed artifact store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the store database and ensure its schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Could not open artifact store {}", path.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifact_types (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attribute_types (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                value_kind TEXT NOT NULL,
                display_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                artifact_type_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (artifact_type_id) REFERENCES artifact_types(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifact_attributes (
                artifact_id TEXT NOT NULL,
                attribute_type_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                text_value TEXT,
                int_value INTEGER,
                PRIMARY KEY (artifact_id, seq),
                FOREIGN KEY (artifact_id) REFERENCES artifacts(id),
                FOREIGN KEY (attribute_type_id) REFERENCES attribute_types(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS data_events (
                id INTEGER PRIMARY KEY,
                artifact_type_id INTEGER NOT NULL,
                posted_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_artifacts_type ON artifacts(artifact_type_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Look up an artifact type id by its derived name.
    pub async fn artifact_type_id(&self, name: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM artifact_types WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Look up the recorded kind of an attribute type by name.
    pub async fn attribute_kind(&self, name: &str) -> Result<Option<ValueKind>> {
        let kind: Option<String> =
            sqlx::query_scalar("SELECT value_kind FROM attribute_types WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(kind.as_deref().and_then(ValueKind::parse))
    }

    /// Read back every artifact of a type, attributes in creation order.
    pub async fn artifacts_of_type(&self, type_name: &str) -> Result<Vec<StoredArtifact>> {
        let Some(type_id) = self.artifact_type_id(type_name).await? else {
            return Ok(Vec::new());
        };

        // rowid is insertion order; created_at is too coarse to sort runs
        // that finish within one second.
        let artifact_rows = sqlx::query(
            "SELECT id, source_path FROM artifacts WHERE artifact_type_id = ? ORDER BY rowid",
        )
        .bind(type_id)
        .fetch_all(&self.pool)
        .await?;

        let mut artifacts = Vec::with_capacity(artifact_rows.len());
        for row in artifact_rows {
            let id: String = row.try_get("id")?;
            let source_path: String = row.try_get("source_path")?;

            let attr_rows = sqlx::query(
                r#"
                SELECT t.name, t.value_kind, a.text_value, a.int_value
                FROM artifact_attributes a
                JOIN attribute_types t ON t.id = a.attribute_type_id
                WHERE a.artifact_id = ?
                ORDER BY a.seq
                "#,
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;

            let mut attributes = Vec::with_capacity(attr_rows.len());
            for attr in attr_rows {
                let name: String = attr.try_get("name")?;
                let kind: String = attr.try_get("value_kind")?;
                let value = match ValueKind::parse(&kind) {
                    Some(ValueKind::Text) => {
                        AttrValue::Text(attr.try_get::<Option<String>, _>("text_value")?.unwrap_or_default())
                    }
                    _ => AttrValue::Integer(attr.try_get::<Option<i64>, _>("int_value")?.unwrap_or(0)),
                };
                attributes.push((name, value));
            }

            artifacts.push(StoredArtifact {
                id,
                source_path,
                attributes,
            });
        }

        Ok(artifacts)
    }

    /// Count data events posted for a type name.
    pub async fn data_event_count(&self, type_name: &str) -> Result<i64> {
        let Some(type_id) = self.artifact_type_id(type_name).await? else {
            return Ok(0);
        };
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM data_events WHERE artifact_type_id = ?")
            .bind(type_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ArtifactSink for SqliteStore {
    async fn ensure_artifact_type(&self, name: &str, description: &str) -> Result<i64> {
        // Atomic check-then-register: the upsert is a no-op on conflict and
        // the id is resolved by name either way.
        sqlx::query("INSERT INTO artifact_types (name, description) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await?;

        let id = sqlx::query_scalar("SELECT id FROM artifact_types WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn ensure_attribute_type(
        &self,
        name: &str,
        kind: ValueKind,
        display_name: &str,
    ) -> Result<i64> {
        sqlx::query(
            "INSERT INTO attribute_types (name, value_kind, display_name) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        let id = sqlx::query_scalar("SELECT id FROM attribute_types WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn add_artifact(
        &self,
        source_path: &str,
        artifact_type_id: i64,
        attributes: Vec<ArtifactAttribute>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO artifacts (id, source_path, artifact_type_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(source_path)
        .bind(artifact_type_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (seq, attr) in attributes.iter().enumerate() {
            let (text_value, int_value) = match &attr.value {
                AttrValue::Text(s) => (Some(s.as_str()), None),
                AttrValue::Integer(i) => (None, Some(*i)),
            };
            sqlx::query(
                "INSERT INTO artifact_attributes (artifact_id, attribute_type_id, seq, text_value, int_value) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(attr.attribute_type_id)
            .bind(seq as i64)
            .bind(text_value)
            .bind(int_value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn post_data_event(&self, artifact_type_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO data_events (artifact_type_id, posted_at) VALUES (?, ?)")
            .bind(artifact_type_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
