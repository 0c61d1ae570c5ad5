use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::ContextDocument;
use super::schema::EstimateValidator;
use crate::core::config::SynthesisConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::retry::RetryPolicy;
use crate::providers::GenerationEngine;
use crate::retrieval::RankedExample;
use crate::store::{CostEstimate, DrawingAnalysis, MetadataStore, Quote, QuoteStatus, RetrievedExample};

/// Turns an analysis plus its grounding examples into a persisted draft quote.
#[derive(Clone)]
pub struct QuoteSynthesizer {
    generator: Arc<dyn GenerationEngine>,
    store: Arc<dyn MetadataStore>,
    validator: Arc<EstimateValidator>,
    config: SynthesisConfig,
    retry: RetryPolicy,
}

impl QuoteSynthesizer {
    pub fn new(
        generator: Arc<dyn GenerationEngine>,
        store: Arc<dyn MetadataStore>,
        config: SynthesisConfig,
        retry: RetryPolicy,
    ) -> EngineResult<Self> {
        Ok(Self {
            generator,
            store,
            validator: Arc::new(EstimateValidator::new()?),
            config,
            retry,
        })
    }

    /// Generate an estimate and persist the draft.
    ///
    /// The quote is written only after generation finishes, so a cancelled or
    /// failed request leaves nothing behind. Persistent schema failures
    /// degrade to a draft flagged for manual estimation.
    pub async fn synthesize(
        &self,
        drawing_ref: &str,
        analysis: DrawingAnalysis,
        user_context: Option<&str>,
        ranked: &[RankedExample],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<Quote> {
        let context = ContextDocument::build(
            drawing_ref,
            &analysis,
            user_context,
            ranked,
            &self.config.currency,
        );

        let estimate = self.generate_estimate(&context, deadline, cancel).await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let retrieved = ranked
            .iter()
            .map(|r| RetrievedExample {
                example_id: r.example.id.clone(),
                similarity: r.similarity,
            })
            .collect();
        let quote = Quote::draft(drawing_ref, analysis, retrieved, estimate);
        self.store.insert_quote(&quote).await?;

        tracing::info!(
            quote_id = %quote.id,
            examples = ranked.len(),
            needs_manual_estimate = quote.needs_manual_estimate,
            "draft quote created"
        );
        Ok(quote)
    }

    async fn generate_estimate(
        &self,
        context: &ContextDocument,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<CostEstimate>> {
        let attempts = self.config.schema_retries + 1;

        for attempt in 1..=attempts {
            let raw = self
                .retry
                .run("estimate generation", deadline, cancel, || {
                    self.generator.synthesize(context)
                })
                .await?;

            match self.validator.parse(&raw, &self.config.currency) {
                Ok(estimate) => return Ok(Some(estimate)),
                Err(err) => {
                    tracing::warn!(attempt, attempts, "generated estimate rejected: {err}");
                }
            }
        }

        tracing::warn!(
            drawing = %context.drawing_ref,
            "no valid estimate after {attempts} attempt(s); manual estimate required"
        );
        Ok(None)
    }

    /// Fill in the estimate of a draft by hand. The same validation rules
    /// as generated estimates apply.
    pub async fn set_manual_estimate(
        &self,
        quote_id: &str,
        estimate: CostEstimate,
        expected_version: i64,
    ) -> EngineResult<Quote> {
        let mut quote = self
            .store
            .get_quote(quote_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("quote {quote_id}")))?;

        if quote.status != QuoteStatus::Draft {
            return Err(EngineError::invalid_transition(quote.status, "manual estimate"));
        }

        let raw = serde_json::to_value(&estimate)?;
        let estimate = self.validator.parse(&raw, &self.config.currency)?;

        quote.generated_estimate = Some(estimate);
        quote.needs_manual_estimate = false;
        self.store.update_quote(&quote, expected_version).await
    }
}
