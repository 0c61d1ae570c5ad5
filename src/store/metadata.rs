//! MetadataStore trait — authoritative records for quotes and learning examples.
//!
//! The vector index is derived from what lives here; anything retrieval
//! returns must first be committed in this store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{
    ExampleBreakdown, ExampleCounts, LearningExample, Quote, QuoteCounts, QuoteStatus,
};
use crate::core::errors::EngineResult;

/// Outcome of writing a pending example.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingInsert {
    Inserted,
    /// A row for the same id or source quote already exists.
    Existing(LearningExample),
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Write `example` in the pending state.
    ///
    /// At most one example exists per source quote; a duplicate is not
    /// written and the stored row is returned instead.
    async fn insert_pending_example(&self, example: &LearningExample)
        -> EngineResult<PendingInsert>;

    /// Make an example visible to retrieval. Committing a committed example
    /// is a no-op.
    ///
    /// The store cannot see the vector index, so it does not check that the
    /// vector exists. Engine code commits only through
    /// `FeedbackLoop::publish`, which inserts the vector first.
    async fn mark_example_committed(&self, id: &str) -> EngineResult<()>;

    async fn get_example(&self, id: &str) -> EngineResult<Option<LearningExample>>;

    /// Committed examples among `ids`, in no particular order.
    async fn get_committed_examples(&self, ids: &[String]) -> EngineResult<Vec<LearningExample>>;

    async fn find_example_by_source_quote(
        &self,
        quote_id: &str,
    ) -> EngineResult<Option<LearningExample>>;

    /// Pending examples created at or before `older_than`.
    async fn list_pending_examples(
        &self,
        older_than: DateTime<Utc>,
    ) -> EngineResult<Vec<LearningExample>>;

    async fn list_committed_examples(&self) -> EngineResult<Vec<LearningExample>>;

    /// Delete an example only while it is still pending.
    async fn delete_pending_example(&self, id: &str) -> EngineResult<bool>;

    /// Committed examples, newest first, optionally for one machine type.
    async fn list_examples(
        &self,
        machine_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<LearningExample>>;

    /// Delete an example in any state.
    async fn delete_example(&self, id: &str) -> EngineResult<bool>;

    async fn count_examples(&self) -> EngineResult<ExampleCounts>;

    async fn example_breakdown(&self) -> EngineResult<ExampleBreakdown>;

    async fn insert_quote(&self, quote: &Quote) -> EngineResult<()>;

    async fn get_quote(&self, id: &str) -> EngineResult<Option<Quote>>;

    /// Persist `quote` if the stored version still equals `expected_version`.
    ///
    /// Returns the stored quote with its bumped version. A stale version
    /// fails with `ConcurrentModification`, an illegal status change with
    /// `InvalidTransition`.
    async fn update_quote(&self, quote: &Quote, expected_version: i64) -> EngineResult<Quote>;

    /// Delete a quote that is still a draft.
    async fn delete_draft_quote(&self, id: &str, expected_version: i64) -> EngineResult<()>;

    /// Newest first.
    async fn list_quotes(
        &self,
        status: Option<QuoteStatus>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Quote>>;

    async fn count_quotes(&self) -> EngineResult<QuoteCounts>;
}
