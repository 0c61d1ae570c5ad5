//! SQLite-backed metadata store.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use super::metadata::{MetadataStore, PendingInsert};
use super::types::{
    now, DrawingAnalysis, ExampleBreakdown, ExampleCounts, ExampleLabels, ExampleState,
    LearningExample, Quote, QuoteCounts, QuoteStatus, UNSPECIFIED,
};
use crate::core::config::AppPaths;
use crate::core::errors::{EngineError, EngineResult};
use crate::vector::{deserialize_embedding, serialize_embedding};

const MAX_LIST_LIMIT: usize = 500;

const EXAMPLE_COLUMNS: &str = "id, description_text, embedding, cost_breakdown, created_at, \
                               source_quote_id, title, notes, machine_type, material, \
                               complexity, working_time_hours, state";

const QUOTE_COLUMNS: &str = "id, drawing_ref, description, embedding, retrieved, estimate, \
                             needs_manual_estimate, status, actual_cost, example_id, version, \
                             created_at, updated_at";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub async fn new(paths: &AppPaths) -> EngineResult<Self> {
        Self::with_path(paths.metadata_db_path.clone()).await
    }

    pub async fn with_path(db_path: PathBuf) -> EngineResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS learning_examples (
                id TEXT PRIMARY KEY,
                description_text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                cost_breakdown TEXT NOT NULL,
                created_at TEXT NOT NULL,
                source_quote_id TEXT UNIQUE,
                title TEXT,
                notes TEXT,
                machine_type TEXT,
                material TEXT,
                complexity TEXT,
                working_time_hours REAL,
                state TEXT NOT NULL DEFAULT 'pending'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_learning_examples_state
             ON learning_examples(state, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS quotes (
                id TEXT PRIMARY KEY,
                drawing_ref TEXT NOT NULL,
                description TEXT NOT NULL,
                embedding BLOB NOT NULL,
                retrieved TEXT NOT NULL DEFAULT '[]',
                estimate TEXT,
                needs_manual_estimate INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'draft',
                actual_cost TEXT,
                example_id TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_quotes_status ON quotes(status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn quote_status_and_version(&self, id: &str) -> EngineResult<Option<(QuoteStatus, i64)>> {
        let row = sqlx::query("SELECT status, version FROM quotes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(Some((status.parse()?, row.try_get("version")?)))
            }
            None => Ok(None),
        }
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed width so timestamps compare correctly as text.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("invalid timestamp '{raw}': {e}")))
}

fn example_from_row(row: &SqliteRow) -> EngineResult<LearningExample> {
    let embedding: Vec<u8> = row.try_get("embedding")?;
    let cost_breakdown: String = row.try_get("cost_breakdown")?;
    let created_at: String = row.try_get("created_at")?;
    let state: String = row.try_get("state")?;

    Ok(LearningExample {
        id: row.try_get("id")?,
        description_text: row.try_get("description_text")?,
        embedding: deserialize_embedding(&embedding),
        cost_breakdown: serde_json::from_str(&cost_breakdown)?,
        created_at: parse_timestamp(&created_at)?,
        source_quote_id: row.try_get("source_quote_id")?,
        labels: ExampleLabels {
            title: row.try_get("title")?,
            notes: row.try_get("notes")?,
            machine_type: row.try_get("machine_type")?,
            material: row.try_get("material")?,
            complexity: row.try_get("complexity")?,
            working_time_hours: row.try_get("working_time_hours")?,
        },
        state: state.parse::<ExampleState>()?,
    })
}

fn quote_from_row(row: &SqliteRow) -> EngineResult<Quote> {
    let embedding: Vec<u8> = row.try_get("embedding")?;
    let retrieved: String = row.try_get("retrieved")?;
    let estimate: Option<String> = row.try_get("estimate")?;
    let actual_cost: Option<String> = row.try_get("actual_cost")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Quote {
        id: row.try_get("id")?,
        drawing_ref: row.try_get("drawing_ref")?,
        analysis: DrawingAnalysis {
            description: row.try_get("description")?,
            embedding: deserialize_embedding(&embedding),
        },
        retrieved: serde_json::from_str(&retrieved)?,
        generated_estimate: estimate.as_deref().map(serde_json::from_str).transpose()?,
        needs_manual_estimate: row.try_get("needs_manual_estimate")?,
        status: status.parse()?,
        actual_cost: actual_cost.as_deref().map(serde_json::from_str).transpose()?,
        example_id: row.try_get("example_id")?,
        version: row.try_get("version")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert_pending_example(
        &self,
        example: &LearningExample,
    ) -> EngineResult<PendingInsert> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO learning_examples
                (id, description_text, embedding, cost_breakdown, created_at,
                 source_quote_id, title, notes, machine_type, material, complexity,
                 working_time_hours, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'pending')",
        )
        .bind(&example.id)
        .bind(&example.description_text)
        .bind(serialize_embedding(&example.embedding))
        .bind(serde_json::to_string(&example.cost_breakdown)?)
        .bind(format_timestamp(&example.created_at))
        .bind(&example.source_quote_id)
        .bind(&example.labels.title)
        .bind(&example.labels.notes)
        .bind(&example.labels.machine_type)
        .bind(&example.labels.material)
        .bind(&example.labels.complexity)
        .bind(example.labels.working_time_hours)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(PendingInsert::Inserted);
        }

        if let Some(quote_id) = &example.source_quote_id {
            if let Some(existing) = self.find_example_by_source_quote(quote_id).await? {
                return Ok(PendingInsert::Existing(existing));
            }
        }
        match self.get_example(&example.id).await? {
            Some(existing) => Ok(PendingInsert::Existing(existing)),
            None => Err(EngineError::Consistency(format!(
                "example {} was neither inserted nor found",
                example.id
            ))),
        }
    }

    async fn mark_example_committed(&self, id: &str) -> EngineResult<()> {
        let result = sqlx::query("UPDATE learning_examples SET state = 'committed' WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("example {id}")));
        }
        Ok(())
    }

    async fn get_example(&self, id: &str) -> EngineResult<Option<LearningExample>> {
        let sql = format!("SELECT {EXAMPLE_COLUMNS} FROM learning_examples WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(example_from_row).transpose()
    }

    async fn get_committed_examples(&self, ids: &[String]) -> EngineResult<Vec<LearningExample>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {EXAMPLE_COLUMNS} FROM learning_examples
             WHERE state = 'committed' AND id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(example_from_row).collect()
    }

    async fn find_example_by_source_quote(
        &self,
        quote_id: &str,
    ) -> EngineResult<Option<LearningExample>> {
        let sql =
            format!("SELECT {EXAMPLE_COLUMNS} FROM learning_examples WHERE source_quote_id = ?1");
        let row = sqlx::query(&sql)
            .bind(quote_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(example_from_row).transpose()
    }

    async fn list_pending_examples(
        &self,
        older_than: DateTime<Utc>,
    ) -> EngineResult<Vec<LearningExample>> {
        let sql = format!(
            "SELECT {EXAMPLE_COLUMNS} FROM learning_examples
             WHERE state = 'pending' AND created_at <= ?1
             ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(format_timestamp(&older_than))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(example_from_row).collect()
    }

    async fn list_committed_examples(&self) -> EngineResult<Vec<LearningExample>> {
        let sql = format!(
            "SELECT {EXAMPLE_COLUMNS} FROM learning_examples
             WHERE state = 'committed' ORDER BY created_at"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(example_from_row).collect()
    }

    async fn delete_pending_example(&self, id: &str) -> EngineResult<bool> {
        let result =
            sqlx::query("DELETE FROM learning_examples WHERE id = ?1 AND state = 'pending'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_examples(
        &self,
        machine_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<LearningExample>> {
        let sql = format!(
            "SELECT {EXAMPLE_COLUMNS} FROM learning_examples
             WHERE state = 'committed' AND (?1 IS NULL OR machine_type = ?1)
             ORDER BY created_at DESC, id
             LIMIT ?2 OFFSET ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(machine_type)
            .bind(limit.min(MAX_LIST_LIMIT) as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(example_from_row).collect()
    }

    async fn delete_example(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM learning_examples WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn example_breakdown(&self) -> EngineResult<ExampleBreakdown> {
        let rows = sqlx::query(
            "SELECT machine_type, complexity, COUNT(*) AS n FROM learning_examples
             WHERE state = 'committed'
             GROUP BY machine_type, complexity",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut breakdown = ExampleBreakdown::default();
        for row in rows {
            let machine: Option<String> = row.try_get("machine_type")?;
            let complexity: Option<String> = row.try_get("complexity")?;
            let n = row.try_get::<i64, _>("n")? as u64;
            *breakdown
                .by_machine_type
                .entry(machine.unwrap_or_else(|| UNSPECIFIED.to_string()))
                .or_default() += n;
            *breakdown
                .by_complexity
                .entry(complexity.unwrap_or_else(|| UNSPECIFIED.to_string()))
                .or_default() += n;
        }
        Ok(breakdown)
    }

    async fn count_examples(&self) -> EngineResult<ExampleCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM learning_examples GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = ExampleCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match state.parse::<ExampleState>()? {
                ExampleState::Pending => counts.pending = n as u64,
                ExampleState::Committed => counts.committed = n as u64,
            }
        }
        Ok(counts)
    }

    async fn insert_quote(&self, quote: &Quote) -> EngineResult<()> {
        let estimate = quote
            .generated_estimate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let actual_cost = quote
            .actual_cost
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO quotes
                (id, drawing_ref, description, embedding, retrieved, estimate,
                 needs_manual_estimate, status, actual_cost, example_id, version,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&quote.id)
        .bind(&quote.drawing_ref)
        .bind(&quote.analysis.description)
        .bind(serialize_embedding(&quote.analysis.embedding))
        .bind(serde_json::to_string(&quote.retrieved)?)
        .bind(estimate)
        .bind(quote.needs_manual_estimate)
        .bind(quote.status.as_str())
        .bind(actual_cost)
        .bind(&quote.example_id)
        .bind(quote.version)
        .bind(format_timestamp(&quote.created_at))
        .bind(format_timestamp(&quote.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_quote(&self, id: &str) -> EngineResult<Option<Quote>> {
        let sql = format!("SELECT {QUOTE_COLUMNS} FROM quotes WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(quote_from_row).transpose()
    }

    async fn update_quote(&self, quote: &Quote, expected_version: i64) -> EngineResult<Quote> {
        let Some((stored_status, stored_version)) =
            self.quote_status_and_version(&quote.id).await?
        else {
            return Err(EngineError::NotFound(format!("quote {}", quote.id)));
        };

        if stored_version != expected_version {
            return Err(EngineError::ConcurrentModification {
                entity: "quote",
                id: quote.id.clone(),
            });
        }
        if stored_status == QuoteStatus::Converted
            || (stored_status != quote.status && !stored_status.can_transition_to(quote.status))
        {
            return Err(EngineError::invalid_transition(stored_status, quote.status));
        }

        let mut updated = quote.clone();
        updated.version = expected_version + 1;
        updated.updated_at = now();

        let estimate = updated
            .generated_estimate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let actual_cost = updated
            .actual_cost
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        // The status guard keeps the transition check valid against a writer
        // that slipped in between the read above and this statement.
        let result = sqlx::query(
            "UPDATE quotes SET
                drawing_ref = ?1, description = ?2, embedding = ?3, retrieved = ?4,
                estimate = ?5, needs_manual_estimate = ?6, status = ?7, actual_cost = ?8,
                example_id = ?9, version = ?10, updated_at = ?11
             WHERE id = ?12 AND version = ?13 AND status = ?14",
        )
        .bind(&updated.drawing_ref)
        .bind(&updated.analysis.description)
        .bind(serialize_embedding(&updated.analysis.embedding))
        .bind(serde_json::to_string(&updated.retrieved)?)
        .bind(estimate)
        .bind(updated.needs_manual_estimate)
        .bind(updated.status.as_str())
        .bind(actual_cost)
        .bind(&updated.example_id)
        .bind(updated.version)
        .bind(format_timestamp(&updated.updated_at))
        .bind(&updated.id)
        .bind(expected_version)
        .bind(stored_status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ConcurrentModification {
                entity: "quote",
                id: quote.id.clone(),
            });
        }

        Ok(updated)
    }

    async fn delete_draft_quote(&self, id: &str, expected_version: i64) -> EngineResult<()> {
        let result =
            sqlx::query("DELETE FROM quotes WHERE id = ?1 AND version = ?2 AND status = 'draft'")
                .bind(id)
                .bind(expected_version)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.quote_status_and_version(id).await? {
            None => Err(EngineError::NotFound(format!("quote {id}"))),
            Some((status, _)) if status != QuoteStatus::Draft => {
                Err(EngineError::invalid_transition(status, "discarded"))
            }
            Some(_) => Err(EngineError::ConcurrentModification {
                entity: "quote",
                id: id.to_string(),
            }),
        }
    }

    async fn list_quotes(
        &self,
        status: Option<QuoteStatus>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Quote>> {
        let sql = format!(
            "SELECT {QUOTE_COLUMNS} FROM quotes
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id
             LIMIT ?2 OFFSET ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit.min(MAX_LIST_LIMIT) as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(quote_from_row).collect()
    }

    async fn count_quotes(&self) -> EngineResult<QuoteCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM quotes GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = QuoteCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<QuoteStatus>()? {
                QuoteStatus::Draft => counts.draft = n as u64,
                QuoteStatus::Finalized => counts.finalized = n as u64,
                QuoteStatus::Converted => counts.converted = n as u64,
            }
        }
        Ok(counts)
    }
}
