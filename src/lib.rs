//! Retrieval-augmented cost estimation for technical drawings.
//!
//! A drawing is analyzed and embedded, the most similar past jobs with
//! verified costs are retrieved, and a generation engine produces a
//! schema-validated estimate grounded in them. Finalized quotes are fed
//! back as new learning examples.

pub mod core;
pub mod engine;
pub mod feedback;
pub mod providers;
pub mod quote;
pub mod retrieval;
pub mod state;
pub mod store;
pub mod vector;

#[cfg(test)]
mod test_support;

pub use crate::core::config::{AppPaths, EngineConfig};
pub use crate::core::errors::{EngineError, EngineResult, ProviderError, ProviderErrorKind};
pub use engine::{EngineStats, EstimationTask, QuoteEngine};
pub use feedback::ReconcileReport;
pub use providers::{DrawingInput, EmbeddingGenerator, GenerationEngine};
pub use quote::ContextDocument;
pub use store::{
    Confidence, CostBreakdown, CostEstimate, DrawingAnalysis, ExampleBreakdown, ExampleLabels,
    LearningExample, LineItem, Quote, QuoteStatus,
};
