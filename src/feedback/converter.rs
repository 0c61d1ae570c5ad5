//! Finalized quote → learning example, and examples taught directly.
//!
//! Commit order:
//! 1. example row written `pending`
//! 2. embedding inserted into the vector index
//! 3. example marked `committed`
//! 4. quote marked `converted` (conversions only)
//!
//! Every step is idempotent, so a caller (or the reconciler) can repeat the
//! whole sequence after a failure at any point without creating a second
//! example. Steps 2 and 3 always run together through [`FeedbackLoop::publish`].

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::errors::{EngineError, EngineResult};
use crate::core::retry::RetryPolicy;
use crate::providers::{DrawingInput, EmbeddingGenerator};
use crate::store::{
    now, CostBreakdown, DrawingAnalysis, ExampleLabels, ExampleState, LearningExample,
    MetadataStore, PendingInsert, Quote, QuoteStatus,
};
use crate::vector::VectorIndex;

#[derive(Clone)]
pub struct FeedbackLoop {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingGenerator>,
    retry: RetryPolicy,
}

impl FeedbackLoop {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingGenerator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            retry,
        }
    }

    /// Convert using the analysis stored with the quote.
    ///
    /// Unset job attributes in `labels` are taken from the quote's estimate.
    pub async fn convert(
        &self,
        quote_id: &str,
        labels: &ExampleLabels,
    ) -> EngineResult<LearningExample> {
        labels.validate()?;
        let quote = self.load_quote(quote_id).await?;
        if let Some(existing) = self.already_converted(&quote).await? {
            return Ok(existing);
        }

        let analysis = quote.analysis.clone();
        self.commit(quote, analysis, labels).await
    }

    /// Convert after analyzing `drawing` again, for quotes whose stored
    /// analysis should not be trusted.
    pub async fn convert_reanalyzed(
        &self,
        quote_id: &str,
        drawing: &DrawingInput,
        labels: &ExampleLabels,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<LearningExample> {
        drawing.validate()?;
        labels.validate()?;
        let quote = self.load_quote(quote_id).await?;
        if let Some(existing) = self.already_converted(&quote).await? {
            return Ok(existing);
        }

        let analysis = self.analyze(drawing, deadline, cancel).await?;
        self.commit(quote, analysis, labels).await
    }

    /// Learn from a finished job that never went through a quote.
    pub async fn teach(
        &self,
        drawing: &DrawingInput,
        cost: CostBreakdown,
        labels: &ExampleLabels,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<LearningExample> {
        drawing.validate()?;
        cost.validate()?;
        labels.validate()?;

        let analysis = self.analyze(drawing, deadline, cancel).await?;
        let example = LearningExample {
            id: uuid::Uuid::new_v4().to_string(),
            description_text: compose_description(
                &analysis.description,
                drawing.user_context.as_deref(),
                labels,
            ),
            embedding: analysis.embedding,
            cost_breakdown: cost,
            created_at: now(),
            source_quote_id: None,
            labels: labels.clone(),
            state: ExampleState::Pending,
        };

        if let PendingInsert::Existing(_) = self.store.insert_pending_example(&example).await? {
            return Err(EngineError::Consistency(format!(
                "example id {} already taken",
                example.id
            )));
        }

        let example = self.publish(example).await?;
        tracing::info!(
            example_id = %example.id,
            drawing = %drawing.drawing_ref,
            total = example.cost_breakdown.total,
            "learning example taught"
        );
        Ok(example)
    }

    /// Delete an example's vector, then its row. If the row delete fails the
    /// reconciler restores the vector and the example stays whole.
    pub async fn remove(&self, example_id: &str) -> EngineResult<LearningExample> {
        let example = self
            .store
            .get_example(example_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("example {example_id}")))?;

        self.index.delete(example_id).await?;
        self.store.delete_example(example_id).await?;

        tracing::info!(example_id, "learning example deleted");
        Ok(example)
    }

    async fn analyze(
        &self,
        drawing: &DrawingInput,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<DrawingAnalysis> {
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
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(analysis)
    }

    async fn load_quote(&self, quote_id: &str) -> EngineResult<Quote> {
        self.store
            .get_quote(quote_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("quote {quote_id}")))
    }

    /// The example of an already converted quote, or `None` if the quote is
    /// eligible for conversion.
    async fn already_converted(&self, quote: &Quote) -> EngineResult<Option<LearningExample>> {
        match quote.status {
            QuoteStatus::Finalized => Ok(None),
            QuoteStatus::Draft => Err(EngineError::invalid_transition(
                QuoteStatus::Draft,
                QuoteStatus::Converted,
            )),
            QuoteStatus::Converted => {
                let example_id = quote.example_id.as_deref().ok_or_else(|| {
                    EngineError::Consistency(format!("converted quote {} has no example", quote.id))
                })?;
                let example = self.store.get_example(example_id).await?.ok_or_else(|| {
                    EngineError::Consistency(format!(
                        "quote {} points at missing example {example_id}",
                        quote.id
                    ))
                })?;
                Ok(Some(example))
            }
        }
    }

    async fn commit(
        &self,
        quote: Quote,
        analysis: DrawingAnalysis,
        labels: &ExampleLabels,
    ) -> EngineResult<LearningExample> {
        let actual_cost = quote.actual_cost.clone().ok_or_else(|| {
            EngineError::Consistency(format!("finalized quote {} has no actual cost", quote.id))
        })?;
        let labels = labels
            .clone()
            .or_from_estimate(quote.generated_estimate.as_ref());

        let candidate = LearningExample {
            id: uuid::Uuid::new_v4().to_string(),
            description_text: compose_description(&analysis.description, None, &labels),
            embedding: analysis.embedding,
            cost_breakdown: actual_cost,
            created_at: now(),
            source_quote_id: Some(quote.id.clone()),
            labels,
            state: ExampleState::Pending,
        };

        let example = match self.store.insert_pending_example(&candidate).await? {
            PendingInsert::Inserted => candidate,
            PendingInsert::Existing(existing) => {
                tracing::debug!(
                    quote_id = %quote.id,
                    example_id = %existing.id,
                    "resuming earlier conversion"
                );
                existing
            }
        };

        self.complete(&quote, example).await
    }

    /// Steps 2 and 3: index the vector, then make the row visible. Nothing
    /// else in the crate calls `mark_example_committed`.
    pub(crate) async fn publish(&self, example: LearningExample) -> EngineResult<LearningExample> {
        self.index.insert(&example.id, &example.embedding).await?;
        self.store.mark_example_committed(&example.id).await?;
        Ok(LearningExample {
            state: ExampleState::Committed,
            ..example
        })
    }

    /// Steps 2-4 for an example that already has its pending row.
    pub(crate) async fn complete(
        &self,
        quote: &Quote,
        example: LearningExample,
    ) -> EngineResult<LearningExample> {
        let example = self.publish(example).await?;

        let already_linked = quote.status == QuoteStatus::Converted
            && quote.example_id.as_deref() == Some(example.id.as_str());
        if !already_linked {
            let mut converted = quote.clone();
            converted.status = QuoteStatus::Converted;
            converted.example_id = Some(example.id.clone());

            match self.store.update_quote(&converted, quote.version).await {
                Ok(_) => {}
                Err(EngineError::ConcurrentModification { entity, id }) => {
                    // Someone else converted first; fine if they used this example.
                    let current = self.load_quote(&quote.id).await?;
                    let same = current.status == QuoteStatus::Converted
                        && current.example_id.as_deref() == Some(example.id.as_str());
                    if !same {
                        return Err(EngineError::ConcurrentModification { entity, id });
                    }
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            quote_id = %quote.id,
            example_id = %example.id,
            total = example.cost_breakdown.total,
            "learning example committed"
        );
        Ok(example)
    }
}

fn compose_description(
    analysis: &str,
    user_description: Option<&str>,
    labels: &ExampleLabels,
) -> String {
    fn field(value: Option<&str>) -> Option<&str> {
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    let mut parts = Vec::with_capacity(7);
    if let Some(title) = field(labels.title.as_deref()) {
        parts.push(format!("Title: {title}"));
    }
    if let Some(description) = field(user_description) {
        parts.push(format!("Description: {description}"));
    }
    parts.push(analysis.trim().to_string());
    if let Some(machine) = field(labels.machine_type.as_deref()) {
        parts.push(format!("Machine: {machine}"));
    }
    if let Some(material) = field(labels.material.as_deref()) {
        parts.push(format!("Material: {material}"));
    }
    if let Some(complexity) = field(labels.complexity.as_deref()) {
        parts.push(format!("Complexity: {complexity}"));
    }
    if let Some(notes) = field(labels.notes.as_deref()) {
        parts.push(format!("Notes: {notes}"));
    }
    parts.join("\n")
}
