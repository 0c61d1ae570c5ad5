mod orchestrator;

pub use orchestrator::{RankedExample, RetrievalOrchestrator};
