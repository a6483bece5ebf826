//! SQLite vector store.
//!
//! Uses a single SQLite database file with two tables:
//! - `collections`: collection names and their vector dimensions
//! - `vectors`: one row per point: little-endian `f32` blob plus JSON payload
//!
//! Similarity is computed in Rust over the rows of one collection, which is
//! adequate for the experience volumes a single agent produces.

use crate::vector::rank_records;
use async_trait::async_trait;
use chrono::Utc;
use kestrel_core::error::MemoryError;
use kestrel_core::vector::{PayloadFilter, ScoredRecord, VectorRecord, VectorStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A persistent vector store backed by SQLite.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open (or create) a store at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database; it is
    /// limited to one connection so every query sees the same database.
    pub async fn new(path: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite vector store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name        TEXT PRIMARY KEY,
                dimensions  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("collections table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                collection  TEXT NOT NULL,
                id          TEXT NOT NULL,
                vector      BLOB NOT NULL,
                payload     TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("vectors table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vectors_created_at ON vectors(collection, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("created_at index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord, MemoryError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| MemoryError::QueryFailed(format!("id column: {e}")))?;
        let blob: Vec<u8> = row
            .try_get("vector")
            .map_err(|e| MemoryError::QueryFailed(format!("vector column: {e}")))?;
        let payload_json: String = row
            .try_get("payload")
            .map_err(|e| MemoryError::QueryFailed(format!("payload column: {e}")))?;

        let payload = serde_json::from_str(&payload_json)
            .map_err(|e| MemoryError::QueryFailed(format!("payload of {id}: {e}")))?;

        Ok(VectorRecord {
            id,
            vector: Self::blob_to_vector(&blob),
            payload,
        })
    }

    async fn dimensions(&self, collection: &str) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT dimensions FROM collections WHERE name = ?1")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("collection lookup: {e}")))?
            .ok_or_else(|| MemoryError::CollectionNotFound(collection.to_string()))?;

        let dims: i64 = row
            .try_get("dimensions")
            .map_err(|e| MemoryError::QueryFailed(format!("dimensions column: {e}")))?;
        Ok(dims as usize)
    }

    async fn load(&self, collection: &str) -> Result<Vec<VectorRecord>, MemoryError> {
        self.dimensions(collection).await?;
        let rows = sqlx::query(
            "SELECT id, vector, payload FROM vectors WHERE collection = ?1 ORDER BY created_at",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::QueryFailed(format!("vector scan: {e}")))?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<(), MemoryError> {
        sqlx::query("INSERT OR IGNORE INTO collections (name, dimensions) VALUES (?1, ?2)")
            .bind(collection)
            .bind(dimensions as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("create collection: {e}")))?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), MemoryError> {
        let dims = self.dimensions(collection).await?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemoryError::Storage(format!("begin: {e}")))?;

        for record in &records {
            if record.vector.len() != dims {
                return Err(MemoryError::Storage(format!(
                    "vector has {} dimensions, collection '{collection}' expects {dims}",
                    record.vector.len()
                )));
            }
            let payload = serde_json::to_string(&record.payload)
                .map_err(|e| MemoryError::Storage(format!("payload serialization: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, vector, payload, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(collection, id) DO UPDATE SET
                    vector = excluded.vector,
                    payload = excluded.payload
                "#,
            )
            .bind(collection)
            .bind(&record.id)
            .bind(Self::vector_to_blob(&record.vector))
            .bind(&payload)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryError::Storage(format!("INSERT failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MemoryError::Storage(format!("commit: {e}")))?;
        debug!(collection, count = records.len(), "Upserted vectors");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        let records = self.load(collection).await?;
        Ok(rank_records(&records, vector, limit, score_threshold, filter))
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, MemoryError> {
        let records = self.load(collection).await?;
        Ok(records
            .into_iter()
            .filter(|r| filter.is_none_or(|f| f.matches(&r.payload)))
            .take(limit)
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM vectors WHERE collection = ?1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MemoryError::QueryFailed(format!("COUNT: {e}")))?;

        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| MemoryError::QueryFailed(format!("cnt column: {e}")))?;
        Ok(cnt as usize)
    }

    async fn clear_collection(&self, collection: &str) -> Result<(), MemoryError> {
        sqlx::query("DELETE FROM vectors WHERE collection = ?1")
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("CLEAR failed: {e}")))?;
        Ok(())
    }
}
