//! Capability seams for the external models.
//!
//! The engine only sees these traits; `OpenAiCompatProvider` is the HTTP
//! implementation used by the daemon.

mod openai_compat;

use async_trait::async_trait;
use serde_json::Value;

pub use openai_compat::OpenAiCompatProvider;

use crate::core::errors::{EngineError, EngineResult, ProviderError};
use crate::quote::ContextDocument;
use crate::store::DrawingAnalysis;

/// A technical drawing submitted for estimation.
#[derive(Debug, Clone)]
pub struct DrawingInput {
    /// Caller-side reference (file name, upload id).
    pub drawing_ref: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Free-form notes from the customer, passed through to generation.
    pub user_context: Option<String>,
}

impl DrawingInput {
    pub fn new(drawing_ref: impl Into<String>, bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            drawing_ref: drawing_ref.into(),
            bytes,
            mime_type: mime_type.into(),
            user_context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.user_context = Some(context.into());
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.bytes.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "drawing '{}' is empty",
                self.drawing_ref
            )));
        }
        if self.mime_type.trim().is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "drawing '{}' has no MIME type",
                self.drawing_ref
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Describe the drawing and embed the description.
    async fn analyze(&self, drawing: &DrawingInput) -> Result<DrawingAnalysis, ProviderError>;
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Produce a raw, unvalidated estimate payload.
    async fn synthesize(&self, context: &ContextDocument) -> Result<Value, ProviderError>;
}
