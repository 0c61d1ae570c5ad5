//! Drawing → similar past jobs.
//!
//! The vector index may briefly disagree with the metadata store (a crash
//! mid-conversion, a manual delete). Such hits are dropped and logged for the
//! reconciler; they never fail an estimation request.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::config::engine::MAX_TOP_K;
use crate::core::config::RetrievalConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::retry::RetryPolicy;
use crate::providers::{DrawingInput, EmbeddingGenerator};
use crate::store::{DrawingAnalysis, LearningExample, MetadataStore};
use crate::vector::{VectorIndex, VectorMatch};

#[derive(Debug, Clone, PartialEq)]
pub struct RankedExample {
    pub example: LearningExample,
    pub similarity: f32,
}

#[derive(Clone)]
pub struct RetrievalOrchestrator {
    embedder: Arc<dyn EmbeddingGenerator>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn MetadataStore>,
    config: RetrievalConfig,
    retry: RetryPolicy,
}

impl RetrievalOrchestrator {
    pub fn new(
        embedder: Arc<dyn EmbeddingGenerator>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn MetadataStore>,
        config: RetrievalConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            config,
            retry,
        }
    }

    /// Describe and embed a drawing, retrying transient provider failures.
    pub async fn analyze(
        &self,
        drawing: &DrawingInput,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<DrawingAnalysis> {
        drawing.validate()?;

        let analysis = self
            .retry
            .run("drawing analysis", deadline, cancel, || {
                self.embedder.analyze(drawing)
            })
            .await?;

        if analysis.embedding.len() != self.index.dimension() {
            return Err(EngineError::DimensionMismatch {
                expected: self.index.dimension(),
                actual: analysis.embedding.len(),
            });
        }
        Ok(analysis)
    }

    /// Analyze `drawing` and fetch the configured number of neighbours.
    pub async fn retrieve(
        &self,
        drawing: &DrawingInput,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<(DrawingAnalysis, Vec<RankedExample>)> {
        let analysis = self.analyze(drawing, deadline, cancel).await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let ranked = self.retrieve_for_analysis(&analysis, None).await?;
        Ok((analysis, ranked))
    }

    /// Nearest committed examples for an existing analysis, most similar first.
    ///
    /// `k` overrides the configured top-k and must lie in 1..=10. Pending or
    /// orphaned vectors never take a committed example's place: the index is
    /// queried with a growing window until `k` committed hits are found or
    /// the index has nothing more to give.
    pub async fn retrieve_for_analysis(
        &self,
        analysis: &DrawingAnalysis,
        k: Option<usize>,
    ) -> EngineResult<Vec<RankedExample>> {
        let k = self.resolve_k(k)?;
        if analysis.embedding.len() != self.index.dimension() {
            return Err(EngineError::DimensionMismatch {
                expected: self.index.dimension(),
                actual: analysis.embedding.len(),
            });
        }

        let mut window = k;
        loop {
            let hits = self.index.query(&analysis.embedding, window).await?;
            let exhausted = hits.len() < window;
            let below_threshold = hits
                .last()
                .is_some_and(|hit| hit.score < self.config.min_similarity);

            let (mut ranked, skipped) = self.hydrate(hits).await?;
            if ranked.len() >= k || exhausted || below_threshold {
                for id in skipped {
                    let err = EngineError::Consistency(format!(
                        "indexed example {id} has no committed metadata"
                    ));
                    tracing::warn!(example_id = %id, "{err}; dropped from retrieval");
                }
                ranked.truncate(k);
                return Ok(ranked);
            }

            tracing::debug!(window, found = ranked.len(), "widening retrieval window");
            window = window.saturating_mul(2);
        }
    }

    /// Committed examples for `hits` in hit order, plus the ids that had none.
    async fn hydrate(
        &self,
        hits: Vec<VectorMatch>,
    ) -> EngineResult<(Vec<RankedExample>, Vec<String>)> {
        let hits: Vec<VectorMatch> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.config.min_similarity)
            .collect();
        if hits.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let mut by_id: HashMap<String, LearningExample> = self
            .store
            .get_committed_examples(&ids)
            .await?
            .into_iter()
            .map(|example| (example.id.clone(), example))
            .collect();

        let mut ranked = Vec::with_capacity(hits.len());
        let mut skipped = Vec::new();
        for hit in hits {
            match by_id.remove(&hit.id) {
                Some(example) => ranked.push(RankedExample {
                    example,
                    similarity: hit.score,
                }),
                None => skipped.push(hit.id),
            }
        }
        Ok((ranked, skipped))
    }

    fn resolve_k(&self, k: Option<usize>) -> EngineResult<usize> {
        match k {
            None => Ok(self.config.top_k),
            Some(k) if (1..=MAX_TOP_K).contains(&k) => Ok(k),
            Some(k) => Err(EngineError::InvalidInput(format!(
                "k must be between 1 and {MAX_TOP_K}, got {k}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::{CostBreakdown, ExampleLabels, ExampleState, SqliteMetadataStore};
    use crate::test_support::ScriptedEmbedder;
    use crate::vector::MemoryVectorIndex;

    async fn setup(
        min_similarity: f32,
    ) -> (RetrievalOrchestrator, Arc<MemoryVectorIndex>, Arc<SqliteMetadataStore>) {
        let index = Arc::new(MemoryVectorIndex::new(2).unwrap());
        let path =
            std::env::temp_dir().join(format!("genquote-retrieval-{}.db", uuid::Uuid::new_v4()));
        let store = Arc::new(SqliteMetadataStore::with_path(path).await.unwrap());
        let orchestrator = RetrievalOrchestrator::new(
            Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0])),
            index.clone(),
            store.clone(),
            RetrievalConfig {
                top_k: 2,
                min_similarity,
            },
            RetryPolicy::default(),
        );
        (orchestrator, index, store)
    }

    async fn add_example(
        index: &MemoryVectorIndex,
        store: &SqliteMetadataStore,
        id: &str,
        vector: [f32; 2],
        commit: bool,
    ) {
        let example = LearningExample {
            id: id.to_string(),
            description_text: format!("part {id}"),
            embedding: vector.to_vec(),
            cost_breakdown: CostBreakdown::new(vec![], 100.0, "EUR"),
            created_at: Utc::now(),
            source_quote_id: None,
            labels: ExampleLabels::default(),
            state: ExampleState::Pending,
        };
        store.insert_pending_example(&example).await.unwrap();
        index.insert(id, &vector).await.unwrap();
        if commit {
            store.mark_example_committed(id).await.unwrap();
        }
    }

    fn analysis() -> DrawingAnalysis {
        DrawingAnalysis {
            description: "new part".to_string(),
            embedding: vec![1.0, 0.0],
        }
    }

    #[tokio::test]
    async fn returns_closest_examples_in_order() {
        let (orchestrator, index, store) = setup(-1.0).await;
        add_example(&index, &store, "E1", [0.0, 1.0], true).await;
        add_example(&index, &store, "E2", [0.6, 0.4], true).await;
        add_example(&index, &store, "E3", [0.95, 0.05], true).await;

        let ranked = orchestrator.retrieve_for_analysis(&analysis(), None).await.unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.example.id.as_str()).collect();
        assert_eq!(ids, vec!["E3", "E2"]);
        assert!(ranked[0].similarity > ranked[1].similarity);
    }

    #[tokio::test]
    async fn drops_uncommitted_and_orphaned_hits() {
        let (orchestrator, index, store) = setup(-1.0).await;
        add_example(&index, &store, "E1", [1.0, 0.0], false).await;
        index.insert("ghost", &[0.9, 0.1]).await.unwrap();
        add_example(&index, &store, "E3", [0.0, 1.0], true).await;

        let ranked = orchestrator
            .retrieve_for_analysis(&analysis(), Some(3))
            .await
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.example.id.as_str()).collect();
        assert_eq!(ids, vec!["E3"]);
    }

    #[tokio::test]
    async fn empty_index_yields_empty_result() {
        let (orchestrator, _, _) = setup(-1.0).await;
        let ranked = orchestrator.retrieve_for_analysis(&analysis(), None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_k_is_rejected() {
        let (orchestrator, _, _) = setup(-1.0).await;
        for k in [0, 11] {
            let err = orchestrator
                .retrieve_for_analysis(&analysis(), Some(k))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)));
        }
    }

    #[tokio::test]
    async fn similarity_threshold_filters_weak_matches() {
        let (orchestrator, index, store) = setup(0.5).await;
        add_example(&index, &store, "close", [1.0, 0.1], true).await;
        add_example(&index, &store, "far", [0.0, 1.0], true).await;

        let ranked = orchestrator.retrieve_for_analysis(&analysis(), None).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].example.id, "close");
    }

    #[tokio::test]
    async fn analysis_with_wrong_dimension_is_rejected() {
        let index = Arc::new(MemoryVectorIndex::new(3).unwrap());
        let path =
            std::env::temp_dir().join(format!("genquote-retrieval-{}.db", uuid::Uuid::new_v4()));
        let store = Arc::new(SqliteMetadataStore::with_path(path).await.unwrap());
        let orchestrator = RetrievalOrchestrator::new(
            Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0])),
            index,
            store,
            RetrievalConfig::default(),
            RetryPolicy::default(),
        );

        let drawing = DrawingInput::new("d.png", vec![1, 2, 3], "image/png");
        let err = orchestrator
            .analyze(&drawing, RetryPolicy::default().deadline_from_now(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn pending_vectors_do_not_displace_committed_examples() {
        let (orchestrator, index, store) = setup(-1.0).await;
        add_example(&index, &store, "committed", [1.0, 0.0], true).await;
        // Same vector, inserted later: wins the recency tie-break in the index.
        add_example(&index, &store, "pending", [1.0, 0.0], false).await;
        index.insert("ghost", &[0.99, 0.01]).await.unwrap();

        let ranked = orchestrator
            .retrieve_for_analysis(&analysis(), Some(1))
            .await
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.example.id.as_str()).collect();
        assert_eq!(ids, vec!["committed"]);
    }

    #[tokio::test]
    async fn widened_window_still_returns_at_most_k() {
        let (orchestrator, index, store) = setup(-1.0).await;
        for i in 0..5 {
            add_example(&index, &store, &format!("p{i}"), [1.0, 0.0], false).await;
        }
        add_example(&index, &store, "A", [0.9, 0.1], true).await;
        add_example(&index, &store, "B", [0.8, 0.2], true).await;
        add_example(&index, &store, "C", [0.7, 0.3], true).await;

        let ranked = orchestrator.retrieve_for_analysis(&analysis(), None).await.unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.example.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }
}
