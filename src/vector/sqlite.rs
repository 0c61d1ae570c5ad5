//! SQLite-backed vector index.
//!
//! Serialized embeddings with brute-force cosine similarity search. Every
//! query reads the table, so an insert committed by any process is visible
//! to the next query once its transaction commits (WAL mode).

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::index::{check_vector, VectorIndex, VectorMatch};
use super::math::{deserialize_embedding, serialize_embedding, top_k};
use crate::core::config::AppPaths;
use crate::core::errors::{EngineError, EngineResult};

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    dimension: usize,
    db_path: PathBuf,
}

impl SqliteVectorIndex {
    pub async fn new(paths: &AppPaths, dimension: usize) -> EngineResult<Self> {
        Self::with_path(paths.vector_db_path.clone(), dimension).await
    }

    /// Open (or create) the index at `db_path`.
    ///
    /// The dimension is recorded on first open; reopening with a different
    /// dimension fails with `DimensionMismatch`.
    pub async fn with_path(db_path: PathBuf, dimension: usize) -> EngineResult<Self> {
        if dimension == 0 {
            return Err(EngineError::InvalidInput(
                "vector dimension must be positive".to_string(),
            ));
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await?;

        let index = Self {
            pool,
            dimension,
            db_path,
        };
        index.init_schema().await?;
        index.check_stored_dimension().await?;
        Ok(index)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vector_entries (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                seq INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vector_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn check_stored_dimension(&self) -> EngineResult<()> {
        sqlx::query("INSERT OR IGNORE INTO vector_meta (key, value) VALUES ('dimension', ?1)")
            .bind(self.dimension.to_string())
            .execute(&self.pool)
            .await?;

        let stored: String =
            sqlx::query_scalar("SELECT value FROM vector_meta WHERE key = 'dimension'")
                .fetch_one(&self.pool)
                .await?;
        let stored: usize = stored
            .parse()
            .map_err(|_| EngineError::Storage(format!("corrupt stored dimension '{stored}'")))?;

        if stored != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: stored,
                actual: self.dimension,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> EngineResult<()> {
        check_vector(self.dimension, vector)?;
        let blob = serialize_embedding(vector);

        sqlx::query(
            "INSERT OR REPLACE INTO vector_entries (id, embedding, seq)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM vector_entries))",
        )
        .bind(id)
        .bind(&blob)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> EngineResult<Vec<VectorMatch>> {
        check_vector(self.dimension, vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT id, embedding, seq FROM vector_entries")
            .fetch_all(&self.pool)
            .await?;

        let entries: Vec<(String, Vec<f32>, i64)> = rows
            .iter()
            .filter_map(|row| {
                let bytes: Vec<u8> = row.get("embedding");
                let embedding = deserialize_embedding(&bytes);
                if embedding.len() != self.dimension {
                    tracing::warn!(
                        id = %row.get::<String, _>("id"),
                        "skipping vector entry with stored dimension {}",
                        embedding.len()
                    );
                    return None;
                }
                Some((row.get("id"), embedding, row.get("seq")))
            })
            .collect();

        Ok(top_k(
            vector,
            entries
                .iter()
                .map(|(id, embedding, seq)| (id.as_str(), embedding.as_slice(), *seq)),
            k,
        ))
    }

    async fn delete(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM vector_entries WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ids(&self) -> EngineResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM vector_entries ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn count(&self) -> EngineResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
