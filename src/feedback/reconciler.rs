//! Repairs the metadata store / vector index pair after partial failures.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::converter::FeedbackLoop;
use crate::core::errors::{EngineError, EngineResult};
use crate::store::{now, LearningExample, MetadataStore, QuoteStatus};
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending examples whose conversion was finished.
    pub completed: usize,
    /// Pending examples removed because their quote can no longer use them.
    pub discarded: usize,
    pub orphan_vectors_removed: usize,
    pub vectors_restored: usize,
    pub failures: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

enum PendingOutcome {
    Completed,
    Discarded,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn VectorIndex>,
    feedback: FeedbackLoop,
    grace_period: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn VectorIndex>,
        feedback: FeedbackLoop,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            index,
            feedback,
            grace_period,
        }
    }

    /// One full pass. Individual failures are logged and counted; only a
    /// failure to list the stores aborts the pass.
    pub async fn reconcile_once(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let grace = chrono::Duration::from_std(self.grace_period)
            .map_err(|e| EngineError::Config(format!("grace period out of range: {e}")))?;
        let stale = self.store.list_pending_examples(now() - grace).await?;

        for example in stale {
            let id = example.id.clone();
            match self.resolve_pending(example).await {
                Ok(PendingOutcome::Completed) => report.completed += 1,
                Ok(PendingOutcome::Discarded) => report.discarded += 1,
                Err(err) => {
                    report.failures += 1;
                    tracing::error!(example_id = %id, "failed to resolve pending example: {err}");
                }
            }
        }

        let committed = self.store.list_committed_examples().await?;
        let committed_ids: HashSet<&str> = committed.iter().map(|e| e.id.as_str()).collect();
        let indexed: HashSet<String> = self.index.ids().await?.into_iter().collect();

        for id in indexed.iter().filter(|id| !committed_ids.contains(id.as_str())) {
            match self.remove_if_orphan(id).await {
                Ok(true) => report.orphan_vectors_removed += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::error!(example_id = %id, "failed to check indexed vector: {err}");
                }
            }
        }

        for example in committed.iter().filter(|e| !indexed.contains(&e.id)) {
            match self.index.insert(&example.id, &example.embedding).await {
                Ok(()) => {
                    report.vectors_restored += 1;
                    tracing::warn!(example_id = %example.id, "restored missing vector");
                }
                Err(err) => {
                    report.failures += 1;
                    tracing::error!(example_id = %example.id, "failed to restore vector: {err}");
                }
            }
        }

        if report.is_clean() {
            tracing::debug!("reconciliation pass found nothing to repair");
        } else {
            tracing::info!(
                completed = report.completed,
                discarded = report.discarded,
                orphan_vectors_removed = report.orphan_vectors_removed,
                vectors_restored = report.vectors_restored,
                failures = report.failures,
                "reconciliation pass finished"
            );
        }
        Ok(report)
    }

    /// Re-insert every committed example and drop vectors nothing refers to.
    /// Returns the number of vectors written.
    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        let committed = self.store.list_committed_examples().await?;
        let keep: HashSet<&str> = committed.iter().map(|e| e.id.as_str()).collect();

        for id in self.index.ids().await? {
            if !keep.contains(id.as_str()) {
                self.remove_if_orphan(&id).await?;
            }
        }
        for example in &committed {
            self.index.insert(&example.id, &example.embedding).await?;
        }

        tracing::info!(vectors = committed.len(), "vector index rebuilt");
        Ok(committed.len())
    }

    async fn resolve_pending(&self, example: LearningExample) -> EngineResult<PendingOutcome> {
        let Some(quote_id) = example.source_quote_id.clone() else {
            // Taught directly: nothing else decides its fate, so finish it.
            self.feedback.publish(example).await?;
            return Ok(PendingOutcome::Completed);
        };
        let quote = self.store.get_quote(&quote_id).await?;

        let resumable = quote.as_ref().is_some_and(|q| {
            q.status == QuoteStatus::Finalized
                || (q.status == QuoteStatus::Converted
                    && q.example_id.as_deref() == Some(example.id.as_str()))
        });

        match quote {
            Some(quote) if resumable => {
                self.feedback.complete(&quote, example).await?;
                Ok(PendingOutcome::Completed)
            }
            _ => {
                // Vector first: if the row delete fails the next pass retries both.
                self.index.delete(&example.id).await?;
                self.store.delete_pending_example(&example.id).await?;
                tracing::warn!(example_id = %example.id, "discarded abandoned pending example");
                Ok(PendingOutcome::Discarded)
            }
        }
    }

    /// Delete `id` from the index unless it belongs to a pending example,
    /// which is either mid-conversion or handled by the pending sweep.
    async fn remove_if_orphan(&self, id: &str) -> EngineResult<bool> {
        if self.store.get_example(id).await?.is_some() {
            return Ok(false);
        }
        let removed = self.index.delete(id).await?;
        if removed {
            let err = EngineError::Consistency(format!("vector {id} has no metadata row"));
            tracing::warn!("{err}; removed from index");
        }
        Ok(removed)
    }
}
