//! `QuoteEngine` — the library entry point.
//!
//! Wires retrieval, synthesis and the feedback loop over shared stores.
//! Cloning is cheap; every request owns its own deadline and cancellation
//! token and shares no mutable state with other requests.

mod task;

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use task::EstimationTask;

use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::feedback::{FeedbackLoop, ReconcileReport, Reconciler};
use crate::providers::{DrawingInput, EmbeddingGenerator, GenerationEngine};
use crate::quote::QuoteSynthesizer;
use crate::retrieval::{RankedExample, RetrievalOrchestrator};
use crate::store::{
    CostBreakdown, CostEstimate, DrawingAnalysis, ExampleBreakdown, ExampleCounts, ExampleLabels,
    LearningExample, MetadataStore, Quote, QuoteCounts, QuoteStatus,
};
use crate::vector::VectorIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub examples: ExampleCounts,
    pub vectors: usize,
    pub quotes: QuoteCounts,
    /// Committed examples grouped by machine type and by complexity.
    pub breakdown: ExampleBreakdown,
}

#[derive(Clone)]
pub struct QuoteEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn VectorIndex>,
    retrieval: RetrievalOrchestrator,
    synthesizer: QuoteSynthesizer,
    feedback: FeedbackLoop,
    reconciler: Reconciler,
}

impl QuoteEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingGenerator>,
        generator: Arc<dyn GenerationEngine>,
    ) -> EngineResult<Self> {
        if index.dimension() != config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: config.dimension,
                actual: index.dimension(),
            });
        }

        let retrieval = RetrievalOrchestrator::new(
            embedder.clone(),
            index.clone(),
            store.clone(),
            config.retrieval.clone(),
            config.retry.clone(),
        );
        let synthesizer = QuoteSynthesizer::new(
            generator,
            store.clone(),
            config.synthesis.clone(),
            config.retry.clone(),
        )?;
        let feedback = FeedbackLoop::new(
            store.clone(),
            index.clone(),
            embedder,
            config.retry.clone(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            index.clone(),
            feedback.clone(),
            config.reconcile.grace_period,
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            index,
            retrieval,
            synthesizer,
            feedback,
            reconciler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Analyze a drawing, ground it in similar past jobs and persist a draft.
    pub async fn request_quote(&self, drawing: DrawingInput) -> EngineResult<Quote> {
        self.request_quote_with_cancel(drawing, CancellationToken::new())
            .await
    }

    pub async fn request_quote_with_cancel(
        &self,
        drawing: DrawingInput,
        cancel: CancellationToken,
    ) -> EngineResult<Quote> {
        let deadline = self.config.retry.deadline_from_now();
        tracing::info!(drawing = %drawing.drawing_ref, "quote requested");

        let (analysis, ranked) = self.retrieval.retrieve(&drawing, deadline, &cancel).await?;
        self.synthesizer
            .synthesize(
                &drawing.drawing_ref,
                analysis,
                drawing.user_context.as_deref(),
                &ranked,
                deadline,
                &cancel,
            )
            .await
    }

    /// Quote from an analysis the caller already holds. No provider call is
    /// made for analysis; only generation runs.
    pub async fn request_quote_for_analysis(
        &self,
        drawing_ref: &str,
        analysis: DrawingAnalysis,
    ) -> EngineResult<Quote> {
        if analysis.embedding.len() != self.config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimension,
                actual: analysis.embedding.len(),
            });
        }
        let deadline = self.config.retry.deadline_from_now();
        tracing::info!(drawing = %drawing_ref, "quote requested for existing analysis");

        let ranked = self.retrieval.retrieve_for_analysis(&analysis, None).await?;
        self.synthesizer
            .synthesize(
                drawing_ref,
                analysis,
                None,
                &ranked,
                deadline,
                &CancellationToken::new(),
            )
            .await
    }

    /// Run `request_quote` on its own task.
    pub fn spawn_quote(&self, drawing: DrawingInput) -> EstimationTask {
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { engine.request_quote_with_cancel(drawing, token).await });
        EstimationTask::new(handle, cancel)
    }

    /// Similar committed examples for an existing analysis.
    pub async fn similar_examples(
        &self,
        analysis: &DrawingAnalysis,
        k: Option<usize>,
    ) -> EngineResult<Vec<RankedExample>> {
        self.retrieval.retrieve_for_analysis(analysis, k).await
    }

    /// Record the verified cost of a draft.
    pub async fn finalize_quote(
        &self,
        quote_id: &str,
        actual_cost: CostBreakdown,
    ) -> EngineResult<Quote> {
        actual_cost.validate()?;
        let mut quote = self.get_quote(quote_id).await?;
        if !quote.status.can_transition_to(QuoteStatus::Finalized) {
            return Err(EngineError::invalid_transition(quote.status, QuoteStatus::Finalized));
        }

        let version = quote.version;
        quote.status = QuoteStatus::Finalized;
        quote.actual_cost = Some(actual_cost);
        let quote = self.store.update_quote(&quote, version).await?;

        tracing::info!(quote_id = %quote.id, "quote finalized");
        Ok(quote)
    }

    pub async fn convert_to_example(&self, quote_id: &str) -> EngineResult<LearningExample> {
        self.feedback
            .convert(quote_id, &ExampleLabels::default())
            .await
    }

    /// Convert with a title, notes or job attributes of the caller's choosing.
    pub async fn convert_to_example_with(
        &self,
        quote_id: &str,
        labels: ExampleLabels,
    ) -> EngineResult<LearningExample> {
        self.feedback.convert(quote_id, &labels).await
    }

    pub async fn convert_reanalyzed(
        &self,
        quote_id: &str,
        drawing: DrawingInput,
    ) -> EngineResult<LearningExample> {
        let deadline = self.config.retry.deadline_from_now();
        self.feedback
            .convert_reanalyzed(
                quote_id,
                &drawing,
                &ExampleLabels::default(),
                deadline,
                &CancellationToken::new(),
            )
            .await
    }

    /// Add a past job with a known cost directly, without a quote.
    pub async fn teach_example(
        &self,
        drawing: DrawingInput,
        cost: CostBreakdown,
        labels: ExampleLabels,
    ) -> EngineResult<LearningExample> {
        let deadline = self.config.retry.deadline_from_now();
        self.feedback
            .teach(&drawing, cost, &labels, deadline, &CancellationToken::new())
            .await
    }

    /// Committed examples, newest first, optionally for one machine type.
    pub async fn list_examples(
        &self,
        machine_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<LearningExample>> {
        self.store.list_examples(machine_type, limit, offset).await
    }

    pub async fn get_example(&self, example_id: &str) -> EngineResult<LearningExample> {
        self.store
            .get_example(example_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("example {example_id}")))
    }

    pub async fn delete_example(&self, example_id: &str) -> EngineResult<LearningExample> {
        self.feedback.remove(example_id).await
    }

    pub async fn set_manual_estimate(
        &self,
        quote_id: &str,
        estimate: CostEstimate,
        expected_version: i64,
    ) -> EngineResult<Quote> {
        self.synthesizer
            .set_manual_estimate(quote_id, estimate, expected_version)
            .await
    }

    /// Delete a draft. Finalized and converted quotes are kept.
    pub async fn discard_quote(&self, quote_id: &str) -> EngineResult<()> {
        let quote = self.get_quote(quote_id).await?;
        self.store.delete_draft_quote(quote_id, quote.version).await?;
        tracing::info!(quote_id, "draft discarded");
        Ok(())
    }

    pub async fn get_quote(&self, quote_id: &str) -> EngineResult<Quote> {
        self.store
            .get_quote(quote_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("quote {quote_id}")))
    }

    pub async fn list_quotes(
        &self,
        status: Option<QuoteStatus>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Quote>> {
        self.store.list_quotes(status, limit, offset).await
    }

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        let (examples, vectors, quotes, breakdown) = futures_util::try_join!(
            self.store.count_examples(),
            self.index.count(),
            self.store.count_quotes(),
            self.store.example_breakdown(),
        )?;
        Ok(EngineStats {
            examples,
            vectors,
            quotes,
            breakdown,
        })
    }

    pub async fn reconcile_once(&self) -> EngineResult<ReconcileReport> {
        self.reconciler.reconcile_once().await
    }

    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        self.reconciler.rebuild_index().await
    }
}
