mod metadata;
mod sqlite;
mod types;

pub use metadata::{MetadataStore, PendingInsert};
pub use sqlite::SqliteMetadataStore;
pub use types::{
    now, Confidence, CostBreakdown, CostEstimate, DrawingAnalysis, ExampleBreakdown, ExampleCounts,
    ExampleLabels, ExampleState, LearningExample, LineItem, Quote, QuoteCounts, QuoteStatus,
    RetrievedExample, UNSPECIFIED,
};
