mod context;
mod schema;
mod synthesizer;

pub use context::{ContextDocument, ContextExample, NO_EXAMPLES_NOTE};
pub use schema::{estimate_schema, EstimateValidator};
pub use synthesizer::QuoteSynthesizer;
